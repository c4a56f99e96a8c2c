//! Capacity range validation

use crate::error::{Error, Result};
use crate::lvm::{round_up_to_extent, EXTENT_SIZE};
use serde::{Deserialize, Serialize};

/// Requested size bounds; zero means unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    pub required_bytes: i64,
    pub limit_bytes: i64,
}

/// Compute the bytes to allocate for `range`.
///
/// Required bytes are rounded up to the extent; the limit is not rounded and
/// bounds the rounded value. An unset requirement allocates one extent.
pub fn allocation_size(range: Option<&CapacityRange>) -> Result<u64> {
    let range = range.copied().unwrap_or_default();
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(Error::InvalidArgument(
            "cannot have negative capacity".into(),
        ));
    }
    let required = range.required_bytes as u64;
    let limit = range.limit_bytes as u64;
    if limit > 0 && required > limit {
        return Err(Error::InvalidArgument(format!(
            "required capacity {} exceeds limit {}",
            required, limit
        )));
    }

    let size = round_up_to_extent(required).max(EXTENT_SIZE);
    if limit > 0 && size > limit {
        return Err(Error::InvalidArgument(format!(
            "allocation of {} bytes exceeds limit {}",
            size, limit
        )));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lvm::MIB;
    use assert_matches::assert_matches;

    fn range(required: i64, limit: i64) -> CapacityRange {
        CapacityRange {
            required_bytes: required,
            limit_bytes: limit,
        }
    }

    #[test]
    fn test_rounds_required_up() {
        assert_eq!(allocation_size(Some(&range(1 << 30, 0))).unwrap(), 1 << 30);
        assert_eq!(
            allocation_size(Some(&range(1073741824 + 2097152, 0))).unwrap(),
            1077936128
        );
        assert_eq!(
            allocation_size(Some(&range(1919999279104, 0))).unwrap(),
            1920001376256
        );
    }

    #[test]
    fn test_limit_is_not_rounded() {
        let size = allocation_size(Some(&range(1073741824 + 2097152, 2147483648 + 3145728))).unwrap();
        assert_eq!(size, 1077936128);

        // Rounded size crosses an unaligned limit
        assert_matches!(
            allocation_size(Some(&range(5 * MIB as i64, 6 * MIB as i64))),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_rejects_invalid_ranges() {
        assert_matches!(
            allocation_size(Some(&range(2 << 30, 1 << 30))),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            allocation_size(Some(&range(-1, 0))),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            allocation_size(Some(&range(0, -5))),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_unset_allocates_one_extent() {
        assert_eq!(allocation_size(None).unwrap(), EXTENT_SIZE);
    }
}
