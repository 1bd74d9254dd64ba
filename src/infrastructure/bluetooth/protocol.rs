//! Remote event protocol
//!
//! Service, characteristic and descriptor contract of the event remote.

use anyhow::Result;
use uuid::Uuid;

/// Event service advertised by the remote
pub const SERVICE_UUID: &str = "12345678-1234-1234-1234-123456789abc";

/// Event characteristic - notify, read and write
pub const EVENT_CHAR_UUID: &str = "12345678-1234-1234-1234-123456789abd";

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

// Numeric forms of the identifiers above, for `Uuid::from_u128`
pub const SERVICE: u128 = 0x12345678_1234_1234_1234_123456789abc;
pub const EVENT_CHARACTERISTIC: u128 = 0x12345678_1234_1234_1234_123456789abd;
pub const CCCD: u128 = 0x00002902_0000_1000_8000_00805f9b34fb;

/// CCCD value that enables notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Written before each polling read; asks the remote to stage its latest event
pub const POLL_TRIGGER: [u8; 1] = [0x01];

/// Advertised names accepted when an advertisement omits the service UUID
pub const KNOWN_DEVICE_NAMES: &[&str] = &[
    "GormeEngellilerKumanda",
    "Engelsiz Yaşam Asistanı",
    "EngelsizYasamAsistani",
];

/// Parse a UUID string, with or without hyphens
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))
}

/// Case-insensitive match against a list of accepted names
pub fn is_known_name(name: &str, accepted: &[String]) -> bool {
    accepted
        .iter()
        .any(|candidate| candidate.to_lowercase() == name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid(SERVICE_UUID).unwrap();
        assert_eq!(uuid.as_u128() >> 96, 0x12345678);
        assert_eq!(
            parse_uuid("12345678123412341234123456789abd").unwrap(),
            parse_uuid(EVENT_CHAR_UUID).unwrap()
        );
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_known_names_ignore_case() {
        let names: Vec<String> = KNOWN_DEVICE_NAMES.iter().map(|s| s.to_string()).collect();
        assert!(is_known_name("gormeengellilerkumanda", &names));
        assert!(is_known_name("ENGELSIZYASAMASISTANI", &names));
        assert!(is_known_name("Engelsiz Yaşam Asistanı", &names));
        assert!(!is_known_name("Some Headphones", &names));
    }

    #[test]
    fn test_numeric_forms_match_strings() {
        assert_eq!(parse_uuid(SERVICE_UUID).unwrap(), Uuid::from_u128(SERVICE));
        assert_eq!(
            parse_uuid(EVENT_CHAR_UUID).unwrap(),
            Uuid::from_u128(EVENT_CHARACTERISTIC)
        );
        assert_eq!(parse_uuid(CCCD_UUID).unwrap(), Uuid::from_u128(CCCD));
    }

    #[test]
    fn test_descriptor_values() {
        assert_eq!(ENABLE_NOTIFICATION_VALUE, [0x01, 0x00]);
        assert_eq!(parse_uuid(CCCD_UUID).unwrap().as_u128() >> 96, 0x2902);
    }
}
