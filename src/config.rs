//! Tool configuration, read from a TOML file.
//!
//! Every key is optional:
//!
//! ```toml
//! signing_info = "signing_info.json"
//! host_tool_paths = ["/opt/android/bin"]
//! verification_timeout_secs = 120
//! avbtool_interpreter = "python3"
//! write_digests = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::sparse::ByteOrder;
use crate::{AvbSignError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// JSON table of per-product signing parameters.
    pub signing_info: PathBuf,
    /// Directories appended to `PATH` for every external tool.
    pub host_tool_paths: Vec<PathBuf>,
    pub verification_timeout_secs: u64,
    /// Explicit avbtool; defaults to the copy in the source tree.
    pub avbtool: Option<PathBuf>,
    /// Interpreter avbtool is run with, when its shebang can't be trusted.
    pub avbtool_interpreter: Option<String>,
    /// Tree-relative location of the avb project.
    pub avb_repository: PathBuf,
    /// Name of the FEC helper avbtool calls.
    pub fec_binary: String,
    /// Make target building the FEC helper.
    pub fec_build_target: String,
    /// Tree-relative directory host tools are built into.
    pub host_out_dir: PathBuf,
    pub lunch_variant: String,
    /// Tree-relative script that sets up the build environment.
    pub source_env_file: PathBuf,
    /// Write a `.sha512` file next to every produced image.
    pub write_digests: bool,
    /// Decode sparse headers with the host byte order.
    pub native_byte_order: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signing_info: PathBuf::from("signing_info.json"),
            host_tool_paths: Vec::new(),
            verification_timeout_secs: 120,
            avbtool: None,
            avbtool_interpreter: None,
            avb_repository: PathBuf::from("external/avb"),
            fec_binary: "fec".into(),
            fec_build_target: "fec".into(),
            host_out_dir: PathBuf::from("out/host/linux-x86/bin"),
            lunch_variant: "userdebug".into(),
            source_env_file: PathBuf::from("build/envsetup.sh"),
            write_digests: true,
            native_byte_order: false,
        }
    }
}

impl Config {
    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            AvbSignError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.verification_timeout_secs == 0 {
            return Err(AvbSignError::Config(
                "verification_timeout_secs must be at least 1".into(),
            ));
        }
        if self.fec_binary.is_empty() {
            return Err(AvbSignError::Config("fec_binary must not be empty".into()));
        }
        Ok(())
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    pub fn sparse_byte_order(&self) -> ByteOrder {
        if self.native_byte_order {
            ByteOrder::Native
        } else {
            ByteOrder::Little
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
