//! Export/import blob: the runtime section followed by the boot section,
//! each an `i32` little-endian record count and that many 12-byte records.

use serde::Serialize;

use crate::error::FeatureError;
use crate::record::{decode_records, encode_records, FeatureConfiguration, RECORD_SIZE};

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct ConfigurationSnapshot {
    pub runtime: Vec<FeatureConfiguration>,
    pub boot: Vec<FeatureConfiguration>,
}

impl ConfigurationSnapshot {
    /// # Errors
    /// Returns [`FeatureError::MalformedBlob`] when a section holds more
    /// records than an `i32` count can describe.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FeatureError> {
        let mut bytes = Vec::with_capacity(
            8 + (self.runtime.len() + self.boot.len()) * RECORD_SIZE,
        );
        for section in [&self.runtime, &self.boot] {
            let count = i32::try_from(section.len()).map_err(|_| {
                FeatureError::MalformedBlob(format!("{} records do not fit a section", section.len()))
            })?;
            bytes.extend_from_slice(&count.to_le_bytes());
            bytes.extend_from_slice(&encode_records(section));
        }
        Ok(bytes)
    }

    /// Parse a blob strictly: negative counts, truncation and trailing
    /// bytes are all rejected.
    ///
    /// # Errors
    /// Returns [`FeatureError::MalformedBlob`] describing the first problem.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FeatureError> {
        let mut cursor = 0;
        let runtime = read_section(bytes, &mut cursor, "runtime")?;
        let boot = read_section(bytes, &mut cursor, "boot")?;
        if cursor != bytes.len() {
            return Err(FeatureError::MalformedBlob(format!(
                "{} trailing bytes after boot section",
                bytes.len() - cursor
            )));
        }
        Ok(Self { runtime, boot })
    }
}

fn read_section(
    bytes: &[u8],
    cursor: &mut usize,
    section: &str,
) -> Result<Vec<FeatureConfiguration>, FeatureError> {
    let header = bytes.get(*cursor..*cursor + 4).ok_or_else(|| {
        FeatureError::MalformedBlob(format!("missing {section} section count"))
    })?;
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(header);
    let count = usize::try_from(i32::from_le_bytes(raw)).map_err(|_| {
        FeatureError::MalformedBlob(format!("negative {section} section count"))
    })?;
    *cursor += 4;

    let end = count
        .checked_mul(RECORD_SIZE)
        .and_then(|len| cursor.checked_add(len))
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            FeatureError::MalformedBlob(format!(
                "{section} section claims {count} records but the blob is truncated"
            ))
        })?;
    let records = decode_records(&bytes[*cursor..end])?;
    *cursor = end;
    Ok(records)
}
