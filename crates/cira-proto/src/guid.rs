//! Device GUID codec
//!
//! The wire carries device identity as a 16-byte GUID whose first three
//! fields are byte-swapped relative to the canonical hyphenated string
//! while the last two fields stay in network order (the mixed-endian
//! layout Windows-style GUIDs use).

use thiserror::Error;
use uuid::Uuid;

/// GUID conversion errors
#[derive(Debug, Error)]
pub enum GuidError {
    #[error("invalid UUID {value:?}: {source}")]
    InvalidUuid {
        value: String,
        #[source]
        source: uuid::Error,
    },
}

/// Convert a canonical hyphenated UUID string to its wire GUID bytes.
pub fn guid_to_wire(uuid: &str) -> Result<[u8; 16], GuidError> {
    let parsed = Uuid::parse_str(uuid).map_err(|source| GuidError::InvalidUuid {
        value: uuid.to_owned(),
        source,
    })?;
    Ok(parsed.to_bytes_le())
}

/// Convert wire GUID bytes back to the canonical hyphenated string.
pub fn wire_to_guid(wire: &[u8; 16]) -> String {
    Uuid::from_bytes_le(*wire).hyphenated().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_permutation() {
        let wire = guid_to_wire("12345678-9abc-def0-1234-56789abcdef0").unwrap();
        assert_eq!(
            wire,
            [
                0x78, 0x56, 0x34, 0x12, // field 1 byte-swapped
                0xbc, 0x9a, // field 2 byte-swapped
                0xf0, 0xde, // field 3 byte-swapped
                0x12, 0x34, // field 4 as written
                0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, // field 5 as written
            ]
        );
    }

    #[test]
    fn string_to_wire_to_string_is_identity() {
        for uuid in [
            "00000000-0000-0000-0000-000000000000",
            "12345678-9abc-def0-1234-56789abcdef0",
            "c7f70ef1-ba1d-4e24-a60c-5f0b84a2f417",
            "ffffffff-ffff-ffff-ffff-ffffffffffff",
        ] {
            let wire = guid_to_wire(uuid).unwrap();
            assert_eq!(wire_to_guid(&wire), uuid);
        }
    }

    #[test]
    fn invalid_uuid_fails() {
        assert!(guid_to_wire("not-a-uuid").is_err());
        assert!(guid_to_wire("12345678-9abc-def0-1234").is_err());
    }
}
