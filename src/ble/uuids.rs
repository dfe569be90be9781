//! BLE Service and Characteristic UUIDs.
//!
//! Both roles must agree on these exact values: the Peripheral publishes
//! them and the Central filters scans and discovery by them.

use uuid::Uuid;

/// Chat service UUID advertised by the Peripheral role.
pub const CHAT_SERVICE_UUID: Uuid = Uuid::from_u128(0x6306_9053_2513_4f84_86de_a5b28841dc54);

/// Message characteristic UUID (Read) inside the chat service.
pub const MESSAGE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x4c84_6b78_3769_4f4b_b665_53e273fb2214);

/// Local name placed in the Peripheral's advertisement.
pub const ADVERTISED_LOCAL_NAME: &str = "BTDEV";

/// Check if a service UUID is the chat service.
pub fn is_chat_service(uuid: &Uuid) -> bool {
    *uuid == CHAT_SERVICE_UUID
}

/// Check if a characteristic UUID is the message characteristic.
pub fn is_message_characteristic(uuid: &Uuid) -> bool {
    *uuid == MESSAGE_CHARACTERISTIC_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            CHAT_SERVICE_UUID.to_string(),
            "63069053-2513-4f84-86de-a5b28841dc54"
        );
        assert_eq!(
            MESSAGE_CHARACTERISTIC_UUID.to_string(),
            "4c846b78-3769-4f4b-b665-53e273fb2214"
        );
    }

    #[test]
    fn test_is_chat_service() {
        assert!(is_chat_service(&CHAT_SERVICE_UUID));
        assert!(!is_chat_service(&MESSAGE_CHARACTERISTIC_UUID));
        assert!(is_message_characteristic(&MESSAGE_CHARACTERISTIC_UUID));
        assert!(!is_message_characteristic(&Uuid::nil()));
    }
}
