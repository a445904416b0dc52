//! # avbsign
//!
//! Verified-boot (AVB) signing for AOSP platform images.
//!
//! Takes a (sparse) filesystem image produced by a platform build and turns
//! it into a signed image set ready to be flashed:
//!
//! - **Sparse header**: recover the size of the original filesystem image
//! - **Partition sizing**: find the smallest partition that holds the image
//!   plus its hash tree, FEC data and footer
//! - **Footer / vbmeta**: drive `avbtool` to append the hash-tree footer,
//!   build the vbmeta image and verify the resulting chain
//!
//! The hashing and signing primitives themselves stay in `avbtool`; this
//! crate only talks to it through its command line.
//!
//! ## Example
//!
//! ```no_run
//! use avbsign::{AvbTool, AospTree, Config, HostTools, SigningPipeline, SigningRequest};
//!
//! let config = Config::load("avbsign.toml").unwrap();
//! let tree = AospTree::open(&config, "aosp/android-8.1.0_r41", None).unwrap();
//! let host_tools = HostTools::for_tree(&config, &tree);
//! let avbtool = AvbTool::for_tree(&config, &tree, host_tools.clone());
//!
//! let request = SigningRequest {
//!     product: "enchilada".into(),
//!     image_path: "out/target/product/enchilada/system.img".into(),
//!     key_path: "external/avb/test/data/testkey_rsa4096.pem".into(),
//!     other_images_dir: "official".into(),
//!     output_dir: "signed".into(),
//! };
//! let mut pipeline = SigningPipeline::new(&config, &avbtool, &tree, &host_tools);
//! pipeline.run(&request).unwrap();
//! ```

pub mod avbtool;
pub mod config;
pub mod exec;
pub mod keys;
pub mod partition;
pub mod pipeline;
pub mod signing_info;
pub mod sparse;
pub mod tree;

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use avbtool::{AvbTool, SigningTool};
pub use config::Config;
pub use exec::HostTools;
pub use partition::compute_partition_size;
pub use pipeline::{SigningPipeline, SigningReport, SigningRequest, SigningState};
pub use signing_info::{HashtreeFooterSpec, SigningInfo, VBMetaSpec};
pub use sparse::{read_original_size, ByteOrder, SparseImageHeader};
pub use tree::{AospTree, SourceTree};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Extension of every image staged in the output directory.
pub const IMAGE_EXTENSION: &str = "img";

/// Extension of the digest file written next to each produced image.
pub const DIGEST_EXTENSION: &str = "sha512";

/// File name of an image for `partition_name` (`system` -> `system.img`).
pub fn image_file_name(partition_name: &str) -> String {
    format!("{partition_name}.{IMAGE_EXTENSION}")
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AvbSignError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed sparse image {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("{command}: {reason}")]
    ExternalTool { command: String, reason: String },

    #[error("image already carries verified-boot metadata: {0}")]
    AlreadySigned(PathBuf),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("verification failed: {0}")]
    VerificationFailure(String),

    #[error("verification of {image} timed out after {timeout_secs} seconds")]
    VerificationTimeout { image: PathBuf, timeout_secs: u64 },

    #[error("cannot build '{target}': {reason}")]
    BuildDependency { target: String, reason: String },

    #[error("unknown {kind} name: {name}")]
    UnknownName { kind: &'static str, name: String },

    #[error("product '{product}' missing from the '{section}' signing info")]
    UnknownProduct { section: &'static str, product: String },

    #[error("invalid signing info: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl AvbSignError {
    /// Process exit status reported by the CLI for this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            AvbSignError::Io(_) | AvbSignError::Other(_) => 1,
            AvbSignError::Config(_)
            | AvbSignError::Toml(_)
            | AvbSignError::Json(_)
            | AvbSignError::UnknownName { .. }
            | AvbSignError::UnknownProduct { .. } => 2,
            AvbSignError::Format { .. } => 3,
            AvbSignError::ExternalTool { .. } => 4,
            AvbSignError::AlreadySigned(_) => 5,
            AvbSignError::Signing(_) => 6,
            AvbSignError::VerificationFailure(_) => 7,
            AvbSignError::VerificationTimeout { .. } => 8,
            AvbSignError::BuildDependency { .. } => 9,
        }
    }
}

pub type Result<T> = std::result::Result<T, AvbSignError>;

// ---------------------------------------------------------------------------
// Enumerations – names as accepted by avbtool
// ---------------------------------------------------------------------------

macro_rules! enum_with_table {
    (
        $(#[$outer:meta])*
        pub enum $Name:ident : $kind:literal {
            $(
                $(#[$inner:meta])*
                $Variant:ident = $val:expr, $short:literal, $long:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
        #[serde(try_from = "String")]
        #[repr(u8)]
        pub enum $Name {
            $(
                $(#[$inner])*
                $Variant = $val,
            )+
        }

        impl $Name {
            /// All known entries as `(value, short_name, long_name)`.
            pub fn table() -> &'static [(u8, &'static str, &'static str)] {
                &[
                    $(
                        ($val, $short, $long),
                    )+
                ]
            }

            /// Look up by short name (case-insensitive).
            pub fn from_name(name: &str) -> Option<Self> {
                Self::table()
                    .iter()
                    .find(|(_, short, _)| short.eq_ignore_ascii_case(name))
                    .and_then(|&(val, _, _)| Self::from_u8(val))
            }

            /// Look up by raw u8 value.
            pub fn from_u8(v: u8) -> Option<Self> {
                $(
                    if v == $val { return Some(Self::$Variant); }
                )+
                None
            }

            /// Name passed on the avbtool command line.
            pub fn short_name(self) -> &'static str {
                for &(val, short, _) in Self::table() {
                    if val == self as u8 { return short; }
                }
                "unknown"
            }

            /// Human-readable long name.
            pub fn long_name(self) -> &'static str {
                for &(val, _, long) in Self::table() {
                    if val == self as u8 { return long; }
                }
                "Unknown"
            }
        }

        impl TryFrom<String> for $Name {
            type Error = AvbSignError;

            fn try_from(name: String) -> Result<Self> {
                Self::from_name(&name).ok_or(AvbSignError::UnknownName {
                    kind: $kind,
                    name,
                })
            }
        }

        impl fmt::Display for $Name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.long_name())
            }
        }
    };
}

enum_with_table! {
    /// Digest used for the hash tree.
    pub enum HashAlgorithm : "hash algorithm" {
        Sha1   = 1, "sha1",   "SHA-1",
        Sha256 = 2, "sha256", "SHA-256",
        Sha512 = 3, "sha512", "SHA-512",
    }
}

impl HashAlgorithm {
    /// Size in bytes of one digest, i.e. of one hash-tree entry before
    /// padding.
    pub fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => <sha1::Sha1 as sha1::Digest>::output_size(),
            HashAlgorithm::Sha256 => <sha2::Sha256 as sha2::Digest>::output_size(),
            HashAlgorithm::Sha512 => <sha2::Sha512 as sha2::Digest>::output_size(),
        }
    }
}

enum_with_table! {
    /// Algorithm used to sign vbmeta structures.
    pub enum SigningAlgorithm : "signing algorithm" {
        None          = 0, "NONE",           "unsigned",
        Sha256Rsa2048 = 1, "SHA256_RSA2048", "SHA-256 with RSA-2048",
        Sha256Rsa4096 = 2, "SHA256_RSA4096", "SHA-256 with RSA-4096",
        Sha256Rsa8192 = 3, "SHA256_RSA8192", "SHA-256 with RSA-8192",
        Sha512Rsa2048 = 4, "SHA512_RSA2048", "SHA-512 with RSA-2048",
        Sha512Rsa4096 = 5, "SHA512_RSA4096", "SHA-512 with RSA-4096",
        Sha512Rsa8192 = 6, "SHA512_RSA8192", "SHA-512 with RSA-8192",
    }
}

impl SigningAlgorithm {
    /// Modulus size the signing key must have, `None` for unsigned.
    pub fn rsa_bits(self) -> Option<usize> {
        match self {
            SigningAlgorithm::None => None,
            SigningAlgorithm::Sha256Rsa2048 | SigningAlgorithm::Sha512Rsa2048 => Some(2048),
            SigningAlgorithm::Sha256Rsa4096 | SigningAlgorithm::Sha512Rsa4096 => Some(4096),
            SigningAlgorithm::Sha256Rsa8192 | SigningAlgorithm::Sha512Rsa8192 => Some(8192),
        }
    }

    /// Digest the signature is computed over.
    pub fn hash_algorithm(self) -> Option<HashAlgorithm> {
        match self {
            SigningAlgorithm::None => None,
            SigningAlgorithm::Sha256Rsa2048
            | SigningAlgorithm::Sha256Rsa4096
            | SigningAlgorithm::Sha256Rsa8192 => Some(HashAlgorithm::Sha256),
            SigningAlgorithm::Sha512Rsa2048
            | SigningAlgorithm::Sha512Rsa4096
            | SigningAlgorithm::Sha512Rsa8192 => Some(HashAlgorithm::Sha512),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_lookup() {
        assert_eq!(HashAlgorithm::from_name("SHA256"), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_name("md5"), None);
        assert_eq!(
            SigningAlgorithm::from_name("sha256_rsa4096"),
            Some(SigningAlgorithm::Sha256Rsa4096)
        );
        assert_eq!(SigningAlgorithm::Sha256Rsa4096.short_name(), "SHA256_RSA4096");
        assert_eq!(SigningAlgorithm::from_u8(0), Some(SigningAlgorithm::None));
    }

    #[test]
    fn digest_sizes() {
        assert_eq!(HashAlgorithm::Sha1.digest_size(), 20);
        assert_eq!(HashAlgorithm::Sha256.digest_size(), 32);
        assert_eq!(HashAlgorithm::Sha512.digest_size(), 64);
    }

    #[test]
    fn rsa_requirements() {
        assert_eq!(SigningAlgorithm::None.rsa_bits(), None);
        assert_eq!(SigningAlgorithm::Sha512Rsa8192.rsa_bits(), Some(8192));
        assert_eq!(
            SigningAlgorithm::Sha512Rsa2048.hash_algorithm(),
            Some(HashAlgorithm::Sha512)
        );
    }

    #[test]
    fn unknown_name_from_string() {
        let err = SigningAlgorithm::try_from("RSA1024".to_string()).unwrap_err();
        assert!(matches!(
            err,
            AvbSignError::UnknownName { kind: "signing algorithm", .. }
        ));
    }

    #[test]
    fn exit_codes_are_distinct_per_pipeline_error() {
        let codes = [
            AvbSignError::Format { path: PathBuf::new(), reason: String::new() }.exit_code(),
            AvbSignError::ExternalTool { command: String::new(), reason: String::new() }
                .exit_code(),
            AvbSignError::AlreadySigned(PathBuf::new()).exit_code(),
            AvbSignError::Signing(String::new()).exit_code(),
            AvbSignError::VerificationFailure(String::new()).exit_code(),
            AvbSignError::VerificationTimeout { image: PathBuf::new(), timeout_secs: 1 }
                .exit_code(),
            AvbSignError::BuildDependency { target: String::new(), reason: String::new() }
                .exit_code(),
        ];
        let mut sorted = codes.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }

    #[test]
    fn image_names() {
        assert_eq!(image_file_name("system"), "system.img");
    }
}
