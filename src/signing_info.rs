//! Per-product signing parameters.
//!
//! The table is a JSON document with one section per avbtool operation,
//! each keyed by product name:
//!
//! ```json
//! {
//!   "add_hashtree_footer": {
//!     "enchilada": {
//!       "partition_name": "system", "hash_algorithm": "sha1",
//!       "block_size": 4096, "salt": "", "algorithm": "SHA256_RSA4096",
//!       "rollback_index": 0, "generate_fec": true, "fec_num_roots": 2,
//!       "setup_as_rootfs_from_kernel": true
//!     }
//!   },
//!   "make_vbmeta_image": {
//!     "enchilada": {
//!       "algorithm": "SHA256_RSA4096", "rollback_index": 0,
//!       "padding_size": 4096,
//!       "include_descriptors_from_image": ["boot.img", "system.img"]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::{AvbSignError, HashAlgorithm, Result, SigningAlgorithm};

/// Parameters of `avbtool add_hashtree_footer` for one product.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HashtreeFooterSpec {
    pub partition_name: String,
    pub hash_algorithm: HashAlgorithm,
    pub block_size: u32,
    /// Hex salt; empty lets avbtool pick a random one.
    #[serde(default)]
    pub salt: String,
    #[serde(rename = "algorithm", default = "unsigned", deserialize_with = "signing_algorithm")]
    pub signing_algorithm: SigningAlgorithm,
    #[serde(default)]
    pub rollback_index: u64,
    #[serde(default)]
    pub generate_fec: bool,
    #[serde(default)]
    pub fec_num_roots: u32,
    #[serde(default)]
    pub setup_as_rootfs_from_kernel: bool,
}

/// Parameters of `avbtool make_vbmeta_image` for one product.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VBMetaSpec {
    #[serde(default = "default_vbmeta_partition")]
    pub partition_name: String,
    #[serde(rename = "algorithm", default = "unsigned", deserialize_with = "signing_algorithm")]
    pub signing_algorithm: SigningAlgorithm,
    #[serde(default)]
    pub rollback_index: u64,
    #[serde(default)]
    pub padding_size: u64,
    /// Images whose descriptors go into the vbmeta image, in order.
    #[serde(rename = "include_descriptors_from_image", default)]
    pub included_image_names: Vec<String>,
}

fn unsigned() -> SigningAlgorithm {
    SigningAlgorithm::None
}

fn default_vbmeta_partition() -> String {
    "vbmeta".into()
}

/// A missing, null or empty algorithm means an unsigned image.
fn signing_algorithm<'de, D>(deserializer: D) -> std::result::Result<SigningAlgorithm, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(SigningAlgorithm::None),
        Some(name) if name.is_empty() => Ok(SigningAlgorithm::None),
        Some(name) => SigningAlgorithm::try_from(name).map_err(serde::de::Error::custom),
    }
}

/// Partition and image names end up as file names in the output directory.
fn is_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

fn invalid(product: &str, reason: String) -> AvbSignError {
    AvbSignError::Config(format!("product '{product}': {reason}"))
}

impl HashtreeFooterSpec {
    fn validate(&self, product: &str) -> Result<()> {
        if !is_file_name(&self.partition_name) {
            return Err(invalid(
                product,
                format!("bad partition name '{}'", self.partition_name),
            ));
        }
        if !self.block_size.is_power_of_two() {
            return Err(invalid(
                product,
                format!("block size {} is not a power of two", self.block_size),
            ));
        }
        if self.generate_fec && self.fec_num_roots == 0 {
            return Err(invalid(product, "FEC requested with 0 roots".into()));
        }
        if !self.salt.is_empty() {
            let salt = hex::decode(&self.salt)
                .map_err(|e| invalid(product, format!("salt is not hex: {e}")))?;
            let digest_size = self.hash_algorithm.digest_size();
            if salt.len() != digest_size {
                warn!(
                    product,
                    "{}-byte salt differs from the {digest_size}-byte {} digest",
                    salt.len(),
                    self.hash_algorithm.short_name()
                );
            }
        }
        Ok(())
    }
}

impl VBMetaSpec {
    fn validate(&self, product: &str) -> Result<()> {
        if !is_file_name(&self.partition_name) {
            return Err(invalid(
                product,
                format!("bad vbmeta partition name '{}'", self.partition_name),
            ));
        }
        if let Some(name) = self.included_image_names.iter().find(|n| !is_file_name(n)) {
            return Err(invalid(product, format!("bad descriptor image name '{name}'")));
        }
        Ok(())
    }
}

/// The whole signing-info table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SigningInfo {
    #[serde(default)]
    add_hashtree_footer: BTreeMap<String, HashtreeFooterSpec>,
    #[serde(default)]
    make_vbmeta_image: BTreeMap<String, VBMetaSpec>,
}

impl SigningInfo {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            AvbSignError::Config(format!("cannot read signing info '{}': {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Validated hash-tree and vbmeta parameters of `product`.
    pub fn product(&self, product: &str) -> Result<(HashtreeFooterSpec, VBMetaSpec)> {
        let hashtree = self
            .add_hashtree_footer
            .get(product)
            .ok_or_else(|| AvbSignError::UnknownProduct {
                section: "add_hashtree_footer",
                product: product.into(),
            })?;
        let vbmeta = self
            .make_vbmeta_image
            .get(product)
            .ok_or_else(|| AvbSignError::UnknownProduct {
                section: "make_vbmeta_image",
                product: product.into(),
            })?;
        hashtree.validate(product)?;
        vbmeta.validate(product)?;
        Ok((hashtree.clone(), vbmeta.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
