//! Repair of the last-known-good configuration blob.
//!
//! The OS occasionally leaves a stale record between the blob's 4-byte
//! header and its record run, and marks it by writing a non-zero header.
//! Booting into LKG with such a blob discards every override. Dropping the
//! stale record and zeroing the header loses that one record and keeps the
//! rest.

use serde::Serialize;

use crate::hive::{Hive, HiveValue};
use crate::layout::StoreLayout;
use crate::record::{read_u32, RECORD_SIZE};

const HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum RepairOutcome {
    Repaired,
    NotNeeded,
    Skipped(String),
}

/// Fix `blob` in memory. `Ok(None)` means the header is already zero.
///
/// # Errors
/// Returns a description when the blob is too short to carry a header and
/// one record.
pub fn strip_stale_record(blob: &[u8]) -> Result<Option<Vec<u8>>, String> {
    if blob.len() < HEADER_SIZE {
        return Err(format!("blob is {} bytes, shorter than its header", blob.len()));
    }
    if read_u32(blob, 0) == 0 {
        return Ok(None);
    }
    if blob.len() < HEADER_SIZE + RECORD_SIZE {
        return Err(format!(
            "blob is {} bytes, too short to hold the stale record",
            blob.len()
        ));
    }

    let mut fixed = Vec::with_capacity(blob.len() - RECORD_SIZE);
    fixed.extend_from_slice(&[0_u8; HEADER_SIZE]);
    fixed.extend_from_slice(&blob[HEADER_SIZE + RECORD_SIZE..]);
    Ok(Some(fixed))
}

/// Read, fix and write back the LKG blob. Never fails: anything that
/// prevents the repair is reported as [`RepairOutcome::Skipped`].
pub fn fix_lkg_store<H: Hive + ?Sized>(hive: &mut H, layout: &StoreLayout) -> RepairOutcome {
    let key = &layout.last_known_good;
    let name = layout.lkg_value_name.as_str();
    let blob = match hive.value(key, name) {
        Ok(Some(HiveValue::Binary(blob))) => blob,
        Ok(Some(other)) => {
            return skipped(format!("{name} is a {} value, expected binary", other.kind_name()));
        }
        Ok(None) => return skipped(format!("{name} is not present")),
        Err(err) => return skipped(err.to_string()),
    };

    match strip_stale_record(&blob) {
        Ok(None) => RepairOutcome::NotNeeded,
        Ok(Some(fixed)) => match hive.set_value(key, name, HiveValue::Binary(fixed)) {
            Ok(()) => {
                tracing::info!(key = %key, "removed stale record from last-known-good store");
                RepairOutcome::Repaired
            }
            Err(err) => skipped(err.to_string()),
        },
        Err(reason) => skipped(reason),
    }
}

fn skipped(reason: String) -> RepairOutcome {
    tracing::warn!(%reason, "last-known-good repair skipped");
    RepairOutcome::Skipped(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HiveError;
    use crate::hive::MemoryHive;

    fn corrupted_blob(records: usize) -> Vec<u8> {
        let mut blob = vec![0x2A, 0, 0, 0];
        blob.extend_from_slice(&[0xEE; RECORD_SIZE]);
        for index in 0..records {
            blob.extend_from_slice(&[u8::try_from(index).unwrap_or(0); RECORD_SIZE]);
        }
        blob
    }

    #[test]
    fn repair_drops_one_record_and_zeroes_header() -> Result<(), String> {
        let blob = corrupted_blob(3);
        let fixed = strip_stale_record(&blob)?.unwrap_or_default();
        assert_eq!(fixed.len(), blob.len() - RECORD_SIZE);
        assert_eq!(&fixed[..4], &[0, 0, 0, 0]);
        assert_eq!(&fixed[4..], &blob[4 + RECORD_SIZE..]);
        Ok(())
    }

    #[test]
    fn clean_and_short_blobs_are_left_alone() {
        assert_eq!(strip_stale_record(&[0, 0, 0, 0, 1, 2]), Ok(None));
        assert!(strip_stale_record(&[1, 0]).is_err());
        assert!(strip_stale_record(&[1, 0, 0, 0, 5]).is_err());
    }

    #[test]
    fn fix_lkg_store_rewrites_hive_value() -> Result<(), HiveError> {
        let layout = StoreLayout::default();
        let mut hive = MemoryHive::new();
        let blob = corrupted_blob(2);
        hive.create_and_open(&layout.last_known_good)?
            .set_value("LKGConfiguration", HiveValue::Binary(blob.clone()))?;

        assert_eq!(fix_lkg_store(&mut hive, &layout), RepairOutcome::Repaired);
        let stored = hive.value(&layout.last_known_good, "LKGConfiguration")?;
        assert_eq!(
            stored.as_ref().and_then(HiveValue::as_binary).map(<[u8]>::len),
            Some(blob.len() - RECORD_SIZE)
        );
        assert_eq!(fix_lkg_store(&mut hive, &layout), RepairOutcome::NotNeeded);
        Ok(())
    }

    #[test]
    fn missing_store_is_skipped_not_failed() {
        let mut hive = MemoryHive::new();
        assert!(matches!(
            fix_lkg_store(&mut hive, &StoreLayout::default()),
            RepairOutcome::Skipped(_)
        ));
    }
}
