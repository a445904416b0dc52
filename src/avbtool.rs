//! The `avbtool` command contract.
//!
//! Hashing, tree building and signing all stay in avbtool, which is only
//! ever run as an external process. [`SigningTool`] is the seam the
//! pipeline talks to; [`AvbTool`] implements it by building avbtool
//! command lines.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::Config;
use crate::exec::{describe_failure, Completion, HostTools, ToolCommand};
use crate::signing_info::{HashtreeFooterSpec, VBMetaSpec};
use crate::tree::SourceTree;
use crate::{AvbSignError, Result};

/// The four verified-boot operations the pipeline needs, plus the size
/// probe used for partition sizing.
pub trait SigningTool {
    /// Whether `image` already carries a verified-boot footer.
    fn has_footer(&self, image: &Path) -> Result<bool>;

    /// Bytes of a `partition_size`-byte partition taken by the hash tree,
    /// FEC data and footer described by `spec`.
    fn metadata_overhead(&self, partition_size: u64, spec: &HashtreeFooterSpec) -> Result<u64>;

    /// Append the hash tree and a signed footer to `image`, in place.
    fn add_hashtree_footer(
        &self,
        image: &Path,
        partition_size: u64,
        spec: &HashtreeFooterSpec,
        key: &Path,
    ) -> Result<()>;

    /// Write a vbmeta image at `output` holding the descriptors of
    /// `descriptor_images`, in that order.
    fn make_vbmeta_image(
        &self,
        output: &Path,
        spec: &VBMetaSpec,
        key: &Path,
        descriptor_images: &[PathBuf],
    ) -> Result<()>;

    /// Verify the chain rooted at `vbmeta_image`. Companion images are
    /// looked up relative to `workdir`, which becomes the tool's cwd.
    fn verify_image(
        &self,
        vbmeta_image: &Path,
        key: &Path,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Command lines
// ---------------------------------------------------------------------------

struct Args(Vec<OsString>);

impl Args {
    fn new(subcommand: &str) -> Self {
        Self(vec![subcommand.into()])
    }

    fn opt(mut self, name: &str, value: impl AsRef<OsStr>) -> Self {
        self.0.push(name.into());
        self.0.push(value.as_ref().to_os_string());
        self
    }

    fn flag(mut self, name: &str) -> Self {
        self.0.push(name.into());
        self
    }

    fn fec(self, spec: &HashtreeFooterSpec) -> Self {
        if spec.generate_fec {
            self.opt("--fec_num_roots", spec.fec_num_roots.to_string())
        } else {
            self.flag("--do_not_generate_fec")
        }
    }
}

pub fn info_image_args(image: &Path) -> Vec<OsString> {
    Args::new("info_image").opt("--image", image).0
}

/// Arguments of the `--calc_max_image_size` probe: avbtool prints the
/// largest image that fits in `partition_size` with this metadata.
pub fn calc_max_image_size_args(partition_size: u64, spec: &HashtreeFooterSpec) -> Vec<OsString> {
    Args::new("add_hashtree_footer")
        .opt("--partition_size", partition_size.to_string())
        .opt("--hash_algorithm", spec.hash_algorithm.short_name())
        .opt("--block_size", spec.block_size.to_string())
        .flag("--calc_max_image_size")
        .fec(spec)
        .0
}

pub fn add_hashtree_footer_args(
    image: &Path,
    partition_size: u64,
    spec: &HashtreeFooterSpec,
    key: &Path,
) -> Vec<OsString> {
    let mut args = Args::new("add_hashtree_footer")
        .opt("--image", image)
        .opt("--partition_size", partition_size.to_string())
        .opt("--partition_name", &spec.partition_name)
        .opt("--hash_algorithm", spec.hash_algorithm.short_name())
        .opt("--block_size", spec.block_size.to_string());
    // An empty salt would be rejected; without the option avbtool draws one.
    if !spec.salt.is_empty() {
        args = args.opt("--salt", &spec.salt);
    }
    args = args
        .opt("--algorithm", spec.signing_algorithm.short_name())
        .opt("--key", key)
        .opt("--rollback_index", spec.rollback_index.to_string())
        .fec(spec);
    if spec.setup_as_rootfs_from_kernel {
        args = args.flag("--setup_as_rootfs_from_kernel");
    }
    args.0
}

pub fn make_vbmeta_image_args(
    output: &Path,
    spec: &VBMetaSpec,
    key: &Path,
    descriptor_images: &[PathBuf],
) -> Vec<OsString> {
    let mut args = Args::new("make_vbmeta_image")
        .opt("--padding_size", spec.padding_size.to_string())
        .opt("--algorithm", spec.signing_algorithm.short_name())
        .opt("--key", key)
        .opt("--rollback_index", spec.rollback_index.to_string())
        .opt("--output", output);
    for image in descriptor_images {
        args = args.opt("--include_descriptors_from_image", image);
    }
    args.0
}

pub fn verify_image_args(vbmeta_image: &Path, key: &Path) -> Vec<OsString> {
    Args::new("verify_image")
        .opt("--image", vbmeta_image)
        .opt("--key", key)
        .0
}

// ---------------------------------------------------------------------------
// avbtool process
// ---------------------------------------------------------------------------

/// What `avbtool info_image` reports for an image without verified-boot
/// metadata. Any other failure is a broken tool or an unreadable image.
const NO_METADATA_MESSAGES: &[&str] = &[
    "does not look like a vbmeta image",
    "does not have a footer",
];

/// avbtool run as a child process.
#[derive(Debug, Clone)]
pub struct AvbTool {
    path: PathBuf,
    interpreter: Option<String>,
    host_tools: HostTools,
}

impl AvbTool {
    pub fn new(path: impl Into<PathBuf>, interpreter: Option<String>, host_tools: HostTools) -> Self {
        Self {
            path: path.into(),
            interpreter,
            host_tools,
        }
    }

    /// The avbtool configured explicitly, or else the one shipped in the
    /// tree's avb project, so the tool always matches the tree release.
    pub fn for_tree(config: &Config, tree: &dyn SourceTree, host_tools: HostTools) -> Self {
        let path = match &config.avbtool {
            Some(path) => path.clone(),
            None => tree.root().join(&config.avb_repository).join("avbtool"),
        };
        info!(
            avbtool = %path.display(),
            revision = tree.revision(),
            "using avbtool"
        );
        Self::new(path, config.avbtool_interpreter.clone(), host_tools)
    }

    fn command(&self, args: Vec<OsString>) -> ToolCommand {
        match &self.interpreter {
            Some(interpreter) => ToolCommand::new(interpreter, &self.host_tools)
                .arg(&self.path)
                .args(args),
            None => ToolCommand::new(&self.path, &self.host_tools).args(args),
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> AvbSignError {
        AvbSignError::ExternalTool {
            command: self.path.display().to_string(),
            reason: format!("cannot run: {e}"),
        }
    }
}

impl SigningTool for AvbTool {
    fn has_footer(&self, image: &Path) -> Result<bool> {
        let output = self
            .command(info_image_args(image))
            .output()
            .map_err(|e| self.spawn_error(e))?;
        debug!(image = %image.display(), status = %output.status, "info_image");
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if NO_METADATA_MESSAGES.iter().any(|m| stderr.contains(m)) {
            return Ok(false);
        }
        Err(AvbSignError::ExternalTool {
            command: format!("{} info_image", self.path.display()),
            reason: describe_failure(output.status, &output.stderr),
        })
    }

    fn metadata_overhead(&self, partition_size: u64, spec: &HashtreeFooterSpec) -> Result<u64> {
        let cmd = self.command(calc_max_image_size_args(partition_size, spec));
        let output = cmd.output().map_err(|e| self.spawn_error(e))?;
        let failure = |reason: String| AvbSignError::ExternalTool {
            command: cmd.to_string(),
            reason,
        };

        if !output.status.success() {
            return Err(failure(describe_failure(output.status, &output.stderr)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let max_image_size: u64 = stdout
            .trim()
            .parse()
            .map_err(|_| failure(format!("unexpected output '{}'", stdout.trim())))?;
        partition_size.checked_sub(max_image_size).ok_or_else(|| {
            failure(format!(
                "maximum image size {max_image_size} exceeds the {partition_size}-byte partition"
            ))
        })
    }

    fn add_hashtree_footer(
        &self,
        image: &Path,
        partition_size: u64,
        spec: &HashtreeFooterSpec,
        key: &Path,
    ) -> Result<()> {
        let output = self
            .command(add_hashtree_footer_args(image, partition_size, spec, key))
            .output()
            .map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            return Err(AvbSignError::Signing(format!(
                "add_hashtree_footer on {}: {}",
                image.display(),
                describe_failure(output.status, &output.stderr)
            )));
        }
        Ok(())
    }

    fn make_vbmeta_image(
        &self,
        output: &Path,
        spec: &VBMetaSpec,
        key: &Path,
        descriptor_images: &[PathBuf],
    ) -> Result<()> {
        let result = self
            .command(make_vbmeta_image_args(output, spec, key, descriptor_images))
            .output()
            .map_err(|e| self.spawn_error(e))?;
        if !result.status.success() {
            return Err(AvbSignError::Signing(format!(
                "make_vbmeta_image {}: {}",
                output.display(),
                describe_failure(result.status, &result.stderr)
            )));
        }
        Ok(())
    }

    fn verify_image(
        &self,
        vbmeta_image: &Path,
        key: &Path,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<()> {
        let completion = self
            .command(verify_image_args(vbmeta_image, key))
            .current_dir(workdir)
            .status_with_timeout(timeout)
            .map_err(|e| self.spawn_error(e))?;
        match completion {
            Completion::Exited(status) if status.success() => Ok(()),
            Completion::Exited(status) => Err(AvbSignError::VerificationFailure(format!(
                "{}: avbtool verify_image exited with {status}",
                vbmeta_image.display()
            ))),
            Completion::TimedOut => Err(AvbSignError::VerificationTimeout {
                image: vbmeta_image.to_path_buf(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
