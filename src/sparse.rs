//! Android sparse image header.
//!
//! Only the fields needed to recover the size of the original (unsparsed)
//! filesystem image are interpreted. The layout follows
//! `system/core/libsparse/sparse_format.h`:
//!
//! ```text
//! 0  u32 magic            0xed26ff3a
//! 4  u16 major_version
//! 6  u16 minor_version
//! 8  u16 file_hdr_sz
//! 10 u16 chunk_hdr_sz
//! 12 u32 blk_sz
//! 16 u32 total_blks
//! 20 u32 total_chunks
//! 24 u32 image_checksum
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::{AvbSignError, Result};

/// Magic number identifying a sparse image.
pub const SPARSE_HEADER_MAGIC: u32 = 0xed26ff3a;

/// Size of the sparse file header in bytes.
pub const SPARSE_HEADER_SIZE: usize = 28;

const BLOCK_SIZE_OFFSET: usize = 12;
const TOTAL_BLOCKS_OFFSET: usize = 16;
const TOTAL_CHUNKS_OFFSET: usize = 20;

/// Byte order used to decode the header fields.
///
/// The format is little-endian. `Native` reproduces tools that decode the
/// size fields with the host byte order and only agrees with `Little` on
/// little-endian hosts. The magic is always read little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Native,
}

impl ByteOrder {
    fn u32_at(self, data: &[u8], offset: usize) -> u32 {
        let bytes = [
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ];
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Native => u32::from_ne_bytes(bytes),
        }
    }
}

/// The parts of the sparse header this crate cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseImageHeader {
    /// Block size in bytes (typically 4096)
    pub block_size: u32,
    /// Number of blocks in the unsparsed image
    pub total_block_count: u32,
    /// Number of chunks in the sparse file (informational)
    pub total_chunks: u32,
}

impl SparseImageHeader {
    /// Decode a header from the start of `data`.
    pub fn from_bytes(data: &[u8], order: ByteOrder) -> std::result::Result<Self, String> {
        if data.len() < SPARSE_HEADER_SIZE {
            return Err(format!(
                "too small ({} bytes, need at least {SPARSE_HEADER_SIZE})",
                data.len()
            ));
        }
        // The magic identifies the format whatever order the fields are
        // decoded with.
        let magic = ByteOrder::Little.u32_at(data, 0);
        if magic != SPARSE_HEADER_MAGIC {
            return Err(format!(
                "bad magic 0x{magic:08x} (expected 0x{SPARSE_HEADER_MAGIC:08x})"
            ));
        }
        Ok(Self {
            block_size: order.u32_at(data, BLOCK_SIZE_OFFSET),
            total_block_count: order.u32_at(data, TOTAL_BLOCKS_OFFSET),
            total_chunks: order.u32_at(data, TOTAL_CHUNKS_OFFSET),
        })
    }

    /// Read the header of the sparse image at `path`.
    pub fn read(path: impl AsRef<Path>, order: ByteOrder) -> Result<Self> {
        let path = path.as_ref();
        let mut buf = Vec::with_capacity(SPARSE_HEADER_SIZE);
        File::open(path)?
            .take(SPARSE_HEADER_SIZE as u64)
            .read_to_end(&mut buf)?;
        Self::from_bytes(&buf, order).map_err(|reason| AvbSignError::Format {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Size in bytes of the original filesystem image.
    pub fn original_image_size(&self) -> u64 {
        u64::from(self.block_size) * u64::from(self.total_block_count)
    }
}

/// Size in bytes of the filesystem image the sparse image at `path` expands
/// to.
pub fn read_original_size(path: impl AsRef<Path>) -> Result<u64> {
    SparseImageHeader::read(path, ByteOrder::Little).map(|h| h.original_image_size())
}

/// Print the sparse header to `stdout`.
pub fn print_sparse_info(path: &Path, header: &SparseImageHeader) {
    println!("Image:        {}", path.display());
    println!("Block Size:   {} Bytes", header.block_size);
    println!("Blocks:       {}", header.total_block_count);
    println!("Chunks:       {}", header.total_chunks);

    let size = header.original_image_size();
    if size >= 1024 * 1024 {
        println!(
            "Image Size:   {} Bytes = {:.2} MiB = {:.2} KiB",
            size,
            size as f64 / (1024.0 * 1024.0),
            size as f64 / 1024.0,
        );
    } else if size >= 1024 {
        println!("Image Size:   {} Bytes = {:.2} KiB", size, size as f64 / 1024.0);
    } else {
        println!("Image Size:   {} Bytes", size);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
