//! AOSP source tree.
//!
//! The signing pipeline only needs three things from a tree: where it is,
//! which release it is (this picks the avbtool copy), and a way to build a
//! missing host tool.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Config;
use crate::exec::{HostTools, ToolCommand};
use crate::{AvbSignError, Result};

/// A source tree able to build targets on demand.
pub trait SourceTree {
    fn root(&self) -> &Path;

    /// Release the tree was synced at, e.g. `android-8.1.0_r41`.
    fn revision(&self) -> &str;

    /// Build `target` for `product`.
    fn build(&self, target: &str, product: &str) -> Result<()>;
}

/// A checked-out AOSP tree built with `lunch` + `make`.
#[derive(Debug, Clone)]
pub struct AospTree {
    root: PathBuf,
    revision: String,
    source_env_file: PathBuf,
    lunch_variant: String,
    host_tools: HostTools,
}

impl AospTree {
    /// Open the tree at `root`. Without an explicit `revision`, the tree
    /// directory name is used, trees being named after their release.
    pub fn open(config: &Config, root: impl AsRef<Path>, revision: Option<String>) -> Result<Self> {
        let root = fs::canonicalize(root.as_ref()).map_err(|e| {
            AvbSignError::Config(format!("cannot open tree '{}': {e}", root.as_ref().display()))
        })?;
        if !root.join(&config.source_env_file).is_file() {
            return Err(AvbSignError::Config(format!(
                "not an AOSP tree: '{}' has no {}",
                root.display(),
                config.source_env_file.display()
            )));
        }

        let revision = match revision {
            Some(r) => r,
            None => root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| AvbSignError::Config("cannot infer tree revision".into()))?,
        };

        Ok(Self {
            root,
            revision,
            source_env_file: config.source_env_file.clone(),
            lunch_variant: config.lunch_variant.clone(),
            host_tools: HostTools::new(config.host_tool_paths.clone()),
        })
    }

    fn build_script(&self, target: &str, product: &str) -> Result<String> {
        for word in [target, product, self.lunch_variant.as_str()] {
            if !is_plain_word(word) {
                return Err(AvbSignError::BuildDependency {
                    target: target.into(),
                    reason: format!("refusing to pass '{word}' to the build shell"),
                });
            }
        }
        Ok(format!(
            "source '{}' && lunch {product}-{} && make {target}",
            self.source_env_file.display(),
            self.lunch_variant,
        ))
    }
}

fn is_plain_word(word: &str) -> bool {
    !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl SourceTree for AospTree {
    fn root(&self) -> &Path {
        &self.root
    }

    fn revision(&self) -> &str {
        &self.revision
    }

    fn build(&self, target: &str, product: &str) -> Result<()> {
        let script = self.build_script(target, product)?;
        info!(build_target = target, product, tree = %self.root.display(), "building");

        let status = ToolCommand::new("bash", &self.host_tools)
            .arg("-c")
            .arg(&script)
            .current_dir(&self.root)
            .status()
            .map_err(|e| AvbSignError::BuildDependency {
                target: target.into(),
                reason: format!("cannot run bash: {e}"),
            })?;

        if !status.success() {
            return Err(AvbSignError::BuildDependency {
                target: target.into(),
                reason: format!("build exited with {status}"),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
