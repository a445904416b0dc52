//! Partition sizing.
//!
//! A partition holding a verified image must also hold its hash tree, the
//! optional FEC data, the vbmeta blob and the footer. How much of a
//! partition that metadata takes depends on the partition size itself, so
//! the smallest fitting size is found by iterating to a fixed point:
//!
//! ```text
//! size = image
//! while size - overhead(size) < image:
//!     size = image + overhead(size)
//! ```
//!
//! Candidates only grow, so the loop terminates as long as `overhead` is
//! non-decreasing and bounded. That is a property of the external tool and
//! is not checked beyond the iteration cap below.

use tracing::{debug, info};

use crate::{AvbSignError, Result};

/// Upper bound on iterations before giving up on the overhead function.
pub const MAX_ITERATIONS: usize = 64;

/// Compute the smallest partition size, in bytes, able to hold an image of
/// `original_size` bytes plus its verification metadata.
///
/// `overhead(candidate)` returns how many bytes of a `candidate`-sized
/// partition the metadata consumes. It usually asks `avbtool` and is
/// specific to one hash-tree configuration; errors are returned unchanged.
pub fn compute_partition_size<F>(original_size: u64, mut overhead: F) -> Result<u64>
where
    F: FnMut(u64) -> Result<u64>,
{
    let mut size = original_size;

    for iteration in 0..=MAX_ITERATIONS {
        let metadata = overhead(size)?;
        let capacity = size.checked_sub(metadata);
        debug!(
            candidate = size,
            metadata,
            iteration,
            "partition size candidate"
        );

        if capacity.is_some_and(|c| c >= original_size) {
            info!(
                image_size = original_size,
                partition_size = size,
                iterations = iteration,
                "partition size computed"
            );
            return Ok(size);
        }

        size = original_size
            .checked_add(metadata)
            .ok_or_else(|| AvbSignError::ExternalTool {
                command: "partition size".into(),
                reason: format!(
                    "metadata overhead {metadata} overflows a {original_size}-byte image"
                ),
            })?;
    }

    Err(AvbSignError::ExternalTool {
        command: "partition size".into(),
        reason: format!(
            "no fixed point after {MAX_ITERATIONS} iterations; metadata size does not converge"
        ),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
