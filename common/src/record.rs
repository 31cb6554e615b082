//! Versioned on-flash record for [`PersistedSettings`].
//!
//! Layout: magic (3) | version (1) | payload length (u32 LE) | JSON payload |
//! first 4 bytes of the payload's SHA-256.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::PersistedSettings;

pub const RECORD_MAGIC: [u8; 3] = *b"SHS";
pub const RECORD_VERSION: u8 = 1;
const HEADER_LEN: usize = 8;
const DIGEST_LEN: usize = 4;
/// Upper bound for a stored record, header and digest included.
pub const MAX_RECORD_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("settings record truncated ({0} bytes)")]
    Truncated(usize),
    #[error("settings record has bad magic")]
    BadMagic,
    #[error("unsupported settings record version {0}")]
    UnsupportedVersion(u8),
    #[error("settings record too large ({0} bytes)")]
    TooLarge(usize),
    #[error("settings record checksum mismatch")]
    Checksum,
    #[error("settings payload invalid: {0}")]
    Payload(#[from] serde_json::Error),
}

pub fn encode(settings: &PersistedSettings) -> Result<Vec<u8>, RecordError> {
    let payload = serde_json::to_vec(settings)?;
    let total = HEADER_LEN + payload.len() + DIGEST_LEN;
    if total > MAX_RECORD_LEN {
        return Err(RecordError::TooLarge(total));
    }

    let mut record = Vec::with_capacity(total);
    record.extend_from_slice(&RECORD_MAGIC);
    record.push(RECORD_VERSION);
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&digest(&payload));
    Ok(record)
}

pub fn decode(raw: &[u8]) -> Result<PersistedSettings, RecordError> {
    if raw.len() < HEADER_LEN + DIGEST_LEN {
        return Err(RecordError::Truncated(raw.len()));
    }
    if raw[..3] != RECORD_MAGIC {
        return Err(RecordError::BadMagic);
    }
    if raw[3] != RECORD_VERSION {
        return Err(RecordError::UnsupportedVersion(raw[3]));
    }

    let payload_len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
    let end = HEADER_LEN.saturating_add(payload_len);
    if end.saturating_add(DIGEST_LEN) > MAX_RECORD_LEN {
        return Err(RecordError::TooLarge(end.saturating_add(DIGEST_LEN)));
    }
    if raw.len() < end + DIGEST_LEN {
        return Err(RecordError::Truncated(raw.len()));
    }

    let payload = &raw[HEADER_LEN..end];
    if raw[end..end + DIGEST_LEN] != digest(payload) {
        return Err(RecordError::Checksum);
    }

    Ok(serde_json::from_slice(payload)?)
}

/// Startup load: an absent or unreadable record yields defaults, and the
/// result is always sanitized.
pub fn load_or_default(raw: Option<&[u8]>) -> (PersistedSettings, Option<RecordError>) {
    let (mut settings, error) = match raw.map(decode) {
        Some(Ok(settings)) => (settings, None),
        Some(Err(err)) => (PersistedSettings::default(), Some(err)),
        None => (PersistedSettings::default(), None),
    };
    settings.sanitize();
    (settings, error)
}

fn digest(payload: &[u8]) -> [u8; DIGEST_LEN] {
    let hash = Sha256::digest(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> PersistedSettings {
        PersistedSettings {
            gas_threshold: 640.0,
            temp_threshold: 41.5,
            auto_mode: false,
            ap_password: "kitchen-ap".to_string(),
            station_ssid: "HomeNet".to_string(),
            station_password: "hunter22".to_string(),
        }
    }

    #[test]
    fn decodes_what_it_encodes() {
        let record = encode(&sample()).unwrap();

        assert_eq!(&record[..3], b"SHS");
        assert_eq!(record[3], RECORD_VERSION);
        assert_eq!(decode(&record).unwrap(), sample());
    }

    #[test]
    fn rejects_flipped_payload_byte() {
        let mut record = encode(&sample()).unwrap();
        record[HEADER_LEN + 2] ^= 0x20;

        assert!(matches!(decode(&record), Err(RecordError::Checksum)));
    }

    #[test]
    fn rejects_unknown_version_and_magic() {
        let mut record = encode(&sample()).unwrap();
        record[3] = 9;
        assert!(matches!(
            decode(&record),
            Err(RecordError::UnsupportedVersion(9))
        ));

        let erased = vec![0xFF_u8; 64];
        assert!(matches!(decode(&erased), Err(RecordError::BadMagic)));
    }

    #[test]
    fn rejects_truncated_record() {
        let record = encode(&sample()).unwrap();
        assert!(matches!(
            decode(&record[..record.len() - 1]),
            Err(RecordError::Truncated(_))
        ));
        assert!(matches!(decode(&[]), Err(RecordError::Truncated(0))));
    }

    #[test]
    fn absent_record_yields_documented_defaults() {
        let (settings, error) = load_or_default(None);

        assert!(error.is_none());
        assert_eq!(settings.gas_threshold, 500.0);
        assert_eq!(settings.temp_threshold, 35.0);
        assert!(settings.auto_mode);
    }

    #[test]
    fn corrupt_record_yields_documented_defaults() {
        let (settings, error) = load_or_default(Some(b"garbage bytes here".as_slice()));

        assert!(error.is_some());
        assert_eq!(settings, PersistedSettings::default());
    }

    #[test]
    fn out_of_range_thresholds_load_as_defaults() {
        let stored = PersistedSettings {
            gas_threshold: 5_000.0,
            temp_threshold: 140.0,
            ..sample()
        };
        let record = encode(&stored).unwrap();

        let (settings, error) = load_or_default(Some(record.as_slice()));

        assert!(error.is_none());
        assert_eq!(settings.gas_threshold, 500.0);
        assert_eq!(settings.temp_threshold, 35.0);
        assert_eq!(settings.station_ssid, "HomeNet");
    }
}
