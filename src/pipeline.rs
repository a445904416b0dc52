//! The signing pipeline.
//!
//! ```text
//! Unsigned --footer--> FooterAdded --vbmeta--> VBMetaGenerated --verify--> Verified
//!     \____________________\_________________________\______________________> Failed
//! ```
//!
//! A run never undoes its own steps: on failure, whatever was staged or
//! produced stays in the output directory for inspection.

use std::env;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha512};
use tracing::{debug, info, warn};

use crate::avbtool::SigningTool;
use crate::config::Config;
use crate::exec::HostTools;
use crate::keys::check_signing_key;
use crate::partition::compute_partition_size;
use crate::signing_info::{HashtreeFooterSpec, SigningInfo, VBMetaSpec};
use crate::sparse::SparseImageHeader;
use crate::tree::SourceTree;
use crate::{image_file_name, AvbSignError, Result, DIGEST_EXTENSION};

/// What to sign and where to put the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    /// Key into the signing-info table.
    pub product: String,
    /// Sparse image to sign. Left untouched; a staged copy is signed.
    pub image_path: PathBuf,
    pub key_path: PathBuf,
    /// Where the images named in the vbmeta descriptor list are taken from.
    pub other_images_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningState {
    Unsigned,
    FooterAdded,
    VBMetaGenerated,
    Verified,
    Failed,
}

impl fmt::Display for SigningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SigningState::Unsigned => "unsigned",
            SigningState::FooterAdded => "footer added",
            SigningState::VBMetaGenerated => "vbmeta generated",
            SigningState::Verified => "verified",
            SigningState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningReport {
    pub state: SigningState,
    pub partition_size: u64,
    /// The staged, now signed, image.
    pub signed_image: PathBuf,
    pub vbmeta_image: PathBuf,
    /// `.sha512` files written next to the produced images.
    pub digests: Vec<PathBuf>,
}

/// Drives one image through footer injection, vbmeta generation and
/// verification.
pub struct SigningPipeline<'a> {
    config: &'a Config,
    tool: &'a dyn SigningTool,
    tree: &'a dyn SourceTree,
    host_tools: &'a HostTools,
    signing_info: Option<SigningInfo>,
    state: SigningState,
}

impl<'a> SigningPipeline<'a> {
    pub fn new(
        config: &'a Config,
        tool: &'a dyn SigningTool,
        tree: &'a dyn SourceTree,
        host_tools: &'a HostTools,
    ) -> Self {
        Self {
            config,
            tool,
            tree,
            host_tools,
            signing_info: None,
            state: SigningState::Unsigned,
        }
    }

    /// Use `info` instead of loading the table named by the configuration.
    pub fn with_signing_info(mut self, info: SigningInfo) -> Self {
        self.signing_info = Some(info);
        self
    }

    /// State reached by the last run.
    pub fn state(&self) -> SigningState {
        self.state
    }

    fn transition(&mut self, state: SigningState) {
        info!(from = %self.state, to = %state, "signing state");
        self.state = state;
    }

    /// Sign `request.image_path` into `request.output_dir`.
    pub fn run(&mut self, request: &SigningRequest) -> Result<SigningReport> {
        self.state = SigningState::Unsigned;
        info!(
            product = %request.product,
            image = %request.image_path.display(),
            output = %request.output_dir.display(),
            "signing image"
        );

        let result = self.execute(request);
        if let Err(e) = &result {
            warn!(state = %self.state, "signing failed: {e}");
            self.transition(SigningState::Failed);
        }
        result
    }

    fn execute(&mut self, request: &SigningRequest) -> Result<SigningReport> {
        if self.tool.has_footer(&request.image_path)? {
            return Err(AvbSignError::AlreadySigned(request.image_path.clone()));
        }

        let (hashtree, vbmeta) = self.specs(&request.product)?;

        // Verification runs inside the output directory, so every path
        // handed to the tool must survive a change of cwd.
        let key = absolute(&request.key_path)?;
        check_signing_key(&key, hashtree.signing_algorithm)?;
        if vbmeta.signing_algorithm != hashtree.signing_algorithm {
            check_signing_key(&key, vbmeta.signing_algorithm)?;
        }

        fs::create_dir_all(&request.output_dir)?;
        let output_dir = fs::canonicalize(&request.output_dir)?;
        let signed_image = self.stage(request, &output_dir, &hashtree, &vbmeta)?;

        if hashtree.generate_fec {
            self.ensure_fec_helper(&request.product)?;
        }

        let header = SparseImageHeader::read(&signed_image, self.config.sparse_byte_order())?;
        let partition_size = compute_partition_size(header.original_image_size(), |size| {
            self.tool.metadata_overhead(size, &hashtree)
        })?;

        self.tool
            .add_hashtree_footer(&signed_image, partition_size, &hashtree, &key)?;
        self.transition(SigningState::FooterAdded);

        let vbmeta_image = output_dir.join(image_file_name(&vbmeta.partition_name));
        let descriptor_images: Vec<PathBuf> = vbmeta
            .included_image_names
            .iter()
            .map(|name| output_dir.join(name))
            .collect();
        self.tool
            .make_vbmeta_image(&vbmeta_image, &vbmeta, &key, &descriptor_images)?;
        self.transition(SigningState::VBMetaGenerated);

        self.tool.verify_image(
            &vbmeta_image,
            &key,
            &output_dir,
            self.config.verification_timeout(),
        )?;
        self.transition(SigningState::Verified);

        let mut digests = Vec::new();
        if self.config.write_digests {
            for image in [&signed_image, &vbmeta_image] {
                digests.push(write_digest(image)?);
            }
        }

        Ok(SigningReport {
            state: self.state,
            partition_size,
            signed_image,
            vbmeta_image,
            digests,
        })
    }

    fn specs(&self, product: &str) -> Result<(HashtreeFooterSpec, VBMetaSpec)> {
        match &self.signing_info {
            Some(info) => info.product(product),
            None => SigningInfo::load(&self.config.signing_info)?.product(product),
        }
    }

    /// Copy the image to sign and its vbmeta companions into `output_dir`,
    /// under the names the tools expect. Returns the staged image.
    fn stage(
        &self,
        request: &SigningRequest,
        output_dir: &Path,
        hashtree: &HashtreeFooterSpec,
        vbmeta: &VBMetaSpec,
    ) -> Result<PathBuf> {
        let signed_name = image_file_name(&hashtree.partition_name);
        let signed_image = output_dir.join(&signed_name);
        stage_file(&request.image_path, &signed_image)?;

        for name in &vbmeta.included_image_names {
            if *name == signed_name {
                continue;
            }
            stage_file(&request.other_images_dir.join(name), &output_dir.join(name))?;
        }
        Ok(signed_image)
    }

    /// Make sure the FEC helper is on the search path, building it once if
    /// it is not.
    fn ensure_fec_helper(&self, product: &str) -> Result<()> {
        let binary = &self.config.fec_binary;
        if let Some(path) = self.host_tools.find(binary) {
            debug!(path = %path.display(), "FEC helper found");
            return Ok(());
        }

        let target = &self.config.fec_build_target;
        info!(binary = %binary, build_target = %target, "FEC helper missing, building it");
        self.tree.build(target, product)?;

        match self.host_tools.find(binary) {
            Some(path) => {
                info!(path = %path.display(), "FEC helper built");
                Ok(())
            }
            None => Err(AvbSignError::BuildDependency {
                target: target.clone(),
                reason: format!("'{binary}' still not on the search path after the build"),
            }),
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

fn stage_file(from: &Path, to: &Path) -> Result<()> {
    // Copying a file onto itself would truncate it.
    if let (Ok(a), Ok(b)) = (fs::canonicalize(from), fs::canonicalize(to)) {
        if a == b {
            return Ok(());
        }
    }
    debug!(from = %from.display(), to = %to.display(), "staging");
    fs::copy(from, to).map_err(|e| {
        AvbSignError::Io(io::Error::new(
            e.kind(),
            format!("cannot stage {} as {}: {e}", from.display(), to.display()),
        ))
    })?;
    Ok(())
}

/// Write the hex SHA-512 of `image` to `<image>.sha512`.
fn write_digest(image: &Path) -> Result<PathBuf> {
    let mut hasher = Sha512::new();
    io::copy(&mut File::open(image)?, &mut hasher)?;
    let digest = hex::encode(hasher.finalize());

    let mut name = image.as_os_str().to_os_string();
    name.push(".");
    name.push(DIGEST_EXTENSION);
    let path = PathBuf::from(name);
    fs::write(&path, digest)?;
    debug!(path = %path.display(), "digest written");
    Ok(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    use crate::sparse::SPARSE_HEADER_MAGIC;

    const KEY: &str = include_str!("testdata/testkey_rsa2048.pem");
    const OVERHEAD: u64 = 69_632;

    // -- fakes --------------------------------------------------------------

    #[derive(Default)]
    struct FakeTool {
        already_signed: bool,
        fail_verification: bool,
        footer_calls: Cell<usize>,
        vbmeta_calls: Cell<usize>,
        partition_sizes: RefCell<Vec<u64>>,
        descriptors: RefCell<Vec<PathBuf>>,
        verify_workdir: RefCell<Option<PathBuf>>,
    }

    impl SigningTool for FakeTool {
        fn has_footer(&self, _image: &Path) -> Result<bool> {
            Ok(self.already_signed)
        }

        fn metadata_overhead(&self, _size: u64, _spec: &HashtreeFooterSpec) -> Result<u64> {
            Ok(OVERHEAD)
        }

        fn add_hashtree_footer(
            &self,
            image: &Path,
            partition_size: u64,
            _spec: &HashtreeFooterSpec,
            _key: &Path,
        ) -> Result<()> {
            self.footer_calls.set(self.footer_calls.get() + 1);
            self.partition_sizes.borrow_mut().push(partition_size);
            let mut file = fs::OpenOptions::new().append(true).open(image)?;
            file.write_all(b"AVBf")?;
            Ok(())
        }

        fn make_vbmeta_image(
            &self,
            output: &Path,
            _spec: &VBMetaSpec,
            _key: &Path,
            descriptor_images: &[PathBuf],
        ) -> Result<()> {
            self.vbmeta_calls.set(self.vbmeta_calls.get() + 1);
            for image in descriptor_images {
                assert!(image.is_file(), "{} not staged", image.display());
            }
            *self.descriptors.borrow_mut() = descriptor_images.to_vec();
            fs::write(output, b"AVB0")?;
            Ok(())
        }

        fn verify_image(
            &self,
            vbmeta_image: &Path,
            _key: &Path,
            workdir: &Path,
            _timeout: Duration,
        ) -> Result<()> {
            *self.verify_workdir.borrow_mut() = Some(workdir.to_path_buf());
            if self.fail_verification {
                return Err(AvbSignError::VerificationFailure(
                    vbmeta_image.display().to_string(),
                ));
            }
            Ok(())
        }
    }

    /// A tree whose build drops an executable `fec` into `bin_dir`.
    struct FakeTree {
        root: PathBuf,
        bin_dir: PathBuf,
        builds: RefCell<Vec<(String, String)>>,
        build_produces_helper: bool,
    }

    impl SourceTree for FakeTree {
        fn root(&self) -> &Path {
            &self.root
        }

        fn revision(&self) -> &str {
            "android-8.1.0_r41"
        }

        fn build(&self, target: &str, product: &str) -> Result<()> {
            self.builds
                .borrow_mut()
                .push((target.to_string(), product.to_string()));
            if self.build_produces_helper {
                let fec = self.bin_dir.join("fec");
                fs::write(&fec, "#!/bin/sh\n")?;
                fs::set_permissions(&fec, fs::Permissions::from_mode(0o755))?;
            }
            Ok(())
        }
    }

    // -- fixture ------------------------------------------------------------

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        tree: FakeTree,
        host_tools: HostTools,
        request: SigningRequest,
    }

    fn sparse_image(block_size: u32, total_blocks: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&28u16.to_le_bytes());
        data.extend_from_slice(&12u16.to_le_bytes());
        data.extend_from_slice(&block_size.to_le_bytes());
        data.extend_from_slice(&total_blocks.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data
    }

    fn signing_info(generate_fec: bool, included: &[&str]) -> SigningInfo {
        let json = serde_json::json!({
            "add_hashtree_footer": {
                "enchilada": {
                    "partition_name": "system",
                    "hash_algorithm": "sha1",
                    "block_size": 4096,
                    "algorithm": "SHA256_RSA2048",
                    "generate_fec": generate_fec,
                    "fec_num_roots": 2,
                    "setup_as_rootfs_from_kernel": true
                }
            },
            "make_vbmeta_image": {
                "enchilada": {
                    "algorithm": "SHA256_RSA2048",
                    "padding_size": 4096,
                    "include_descriptors_from_image": included
                }
            }
        });
        serde_json::from_value(json).unwrap()
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("aosp");
        let bin_dir = dir.path().join("host-bin");
        let official = dir.path().join("official");
        for d in [&root, &bin_dir, &official] {
            fs::create_dir_all(d).unwrap();
        }

        let image_path = root.join("system.img");
        fs::write(&image_path, sparse_image(4096, 256)).unwrap();
        for name in ["boot.img", "vendor.img", "system.img"] {
            fs::write(official.join(name), format!("official {name}")).unwrap();
        }
        let key_path = dir.path().join("testkey_rsa2048.pem");
        fs::write(&key_path, KEY).unwrap();

        Fixture {
            config: Config::default(),
            tree: FakeTree {
                root,
                bin_dir: bin_dir.clone(),
                builds: RefCell::new(Vec::new()),
                build_produces_helper: true,
            },
            host_tools: HostTools::isolated([bin_dir]),
            request: SigningRequest {
                product: "enchilada".into(),
                image_path,
                key_path,
                other_images_dir: official,
                output_dir: dir.path().join("signed"),
            },
            _dir: dir,
        }
    }

    fn run(f: &Fixture, tool: &FakeTool, info: SigningInfo) -> (Result<SigningReport>, SigningState) {
        let mut pipeline =
            SigningPipeline::new(&f.config, tool, &f.tree, &f.host_tools).with_signing_info(info);
        let result = pipeline.run(&f.request);
        (result, pipeline.state())
    }

    // -- tests --------------------------------------------------------------

    #[test]
    fn full_run_reaches_verified() {
        let f = fixture();
        let tool = FakeTool::default();
        let info = signing_info(false, &["boot.img", "system.img", "vendor.img"]);
        let (result, state) = run(&f, &tool, info);
        let report = result.unwrap();

        assert_eq!(state, SigningState::Verified);
        assert_eq!(report.state, SigningState::Verified);
        assert_eq!(report.partition_size, 4096 * 256 + OVERHEAD);
        assert_eq!(*tool.partition_sizes.borrow(), vec![4096 * 256 + OVERHEAD]);

        let output = fs::canonicalize(&f.request.output_dir).unwrap();
        assert_eq!(report.signed_image, output.join("system.img"));
        assert_eq!(report.vbmeta_image, output.join("vbmeta.img"));
        assert_eq!(*tool.verify_workdir.borrow(), Some(output.clone()));

        // The staged copy was signed, the source image was not.
        assert!(fs::read(&report.signed_image).unwrap().ends_with(b"AVBf"));
        assert_eq!(fs::read(&f.request.image_path).unwrap(), sparse_image(4096, 256));
        // Companions come from the official images, the signed image does not.
        assert_ne!(
            fs::read(output.join("system.img")).unwrap(),
            b"official system.img".to_vec()
        );
        assert_eq!(
            fs::read_to_string(output.join("boot.img")).unwrap(),
            "official boot.img"
        );

        assert_eq!(
            report.digests,
            vec![output.join("system.img.sha512"), output.join("vbmeta.img.sha512")]
        );
        let expected = hex::encode(Sha512::digest(b"AVB0"));
        assert_eq!(fs::read_to_string(&report.digests[1]).unwrap(), expected);
    }

    #[test]
    fn already_signed_image_is_refused_every_time() {
        let f = fixture();
        let tool = FakeTool {
            already_signed: true,
            ..Default::default()
        };
        for _ in 0..2 {
            let (result, state) = run(&f, &tool, signing_info(false, &["system.img"]));
            assert!(matches!(result, Err(AvbSignError::AlreadySigned(_))));
            assert_eq!(state, SigningState::Failed);
        }
        assert_eq!(tool.footer_calls.get(), 0);
        assert_eq!(tool.vbmeta_calls.get(), 0);
        assert!(!f.request.output_dir.exists());
    }

    #[test]
    fn missing_fec_helper_is_built_once() {
        let f = fixture();
        let tool = FakeTool::default();

        let (result, _) = run(&f, &tool, signing_info(true, &["system.img"]));
        result.unwrap();
        assert_eq!(
            *f.tree.builds.borrow(),
            vec![("fec".to_string(), "enchilada".to_string())]
        );
        assert_eq!(tool.footer_calls.get(), 1);

        // Second run: the helper is there now, and the output is fresh.
        fs::remove_dir_all(&f.request.output_dir).unwrap();
        let (result, _) = run(&f, &tool, signing_info(true, &["system.img"]));
        result.unwrap();
        assert_eq!(f.tree.builds.borrow().len(), 1);
        assert_eq!(tool.footer_calls.get(), 2);
    }

    #[test]
    fn fec_build_without_helper_is_dependency_error() {
        let mut f = fixture();
        f.tree.build_produces_helper = false;
        let tool = FakeTool::default();
        let (result, state) = run(&f, &tool, signing_info(true, &["system.img"]));
        assert!(matches!(result, Err(AvbSignError::BuildDependency { .. })));
        assert_eq!(state, SigningState::Failed);
        assert_eq!(f.tree.builds.borrow().len(), 1);
        assert_eq!(tool.footer_calls.get(), 0);
    }

    #[test]
    fn no_fec_means_no_build() {
        let f = fixture();
        let tool = FakeTool::default();
        run(&f, &tool, signing_info(false, &["system.img"])).0.unwrap();
        assert!(f.tree.builds.borrow().is_empty());
    }

    #[test]
    fn descriptor_order_is_preserved() {
        let cases: [&[&str]; 3] = [
            &[],
            &["boot.img"],
            &["vendor.img", "system.img", "boot.img"],
        ];
        for names in cases {
            let f = fixture();
            let tool = FakeTool::default();
            run(&f, &tool, signing_info(false, names)).0.unwrap();

            let output = fs::canonicalize(&f.request.output_dir).unwrap();
            let expected: Vec<PathBuf> = names.iter().map(|n| output.join(n)).collect();
            assert_eq!(*tool.descriptors.borrow(), expected);
        }
    }

    #[test]
    fn failed_verification_leaves_artifacts() {
        let f = fixture();
        let tool = FakeTool {
            fail_verification: true,
            ..Default::default()
        };
        let (result, state) = run(&f, &tool, signing_info(false, &["boot.img", "system.img"]));
        assert!(matches!(result, Err(AvbSignError::VerificationFailure(_))));
        assert_eq!(state, SigningState::Failed);

        let output = &f.request.output_dir;
        assert!(output.join("system.img").is_file());
        assert!(output.join("boot.img").is_file());
        assert!(output.join("vbmeta.img").is_file());
        assert!(!output.join("vbmeta.img.sha512").exists());
    }

    #[test]
    fn wrong_key_size_fails_before_staging_and_build() {
        let f = fixture();
        let tool = FakeTool::default();
        let json = serde_json::json!({
            "add_hashtree_footer": {
                "enchilada": {
                    "partition_name": "system",
                    "hash_algorithm": "sha256",
                    "block_size": 4096,
                    "algorithm": "SHA256_RSA4096",
                    "generate_fec": true,
                    "fec_num_roots": 2
                }
            },
            "make_vbmeta_image": { "enchilada": { "algorithm": "SHA256_RSA4096" } }
        });
        let (result, state) = run(&f, &tool, serde_json::from_value(json).unwrap());
        assert!(matches!(result, Err(AvbSignError::Signing(_))));
        assert_eq!(state, SigningState::Failed);
        assert_eq!(tool.footer_calls.get(), 0);
        // Rejected before anything is staged or built.
        assert!(f.tree.builds.borrow().is_empty());
        assert!(!f.request.output_dir.exists());
    }

    #[test]
    fn raw_image_is_format_error() {
        let f = fixture();
        fs::write(&f.request.image_path, vec![0u8; 4096]).unwrap();
        let tool = FakeTool::default();
        let (result, _) = run(&f, &tool, signing_info(false, &["system.img"]));
        assert!(matches!(result, Err(AvbSignError::Format { .. })));
        assert_eq!(tool.footer_calls.get(), 0);
    }

    #[test]
    fn unknown_product_is_reported() {
        let mut f = fixture();
        f.request.product = "walleye".into();
        let tool = FakeTool::default();
        let (result, _) = run(&f, &tool, signing_info(false, &[]));
        assert!(matches!(result, Err(AvbSignError::UnknownProduct { .. })));
    }

    #[test]
    fn digests_can_be_disabled() {
        let mut f = fixture();
        f.config.write_digests = false;
        let tool = FakeTool::default();
        let report = run(&f, &tool, signing_info(false, &[])).0.unwrap();
        assert!(report.digests.is_empty());
        assert!(!f.request.output_dir.join("system.img.sha512").exists());
    }
}
