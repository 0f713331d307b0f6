//! Mesh Protocol Constants
//!
//! Identifiers and limits every node in a deployment agrees on.

use uuid::Uuid;

use crate::config::Role;

/// GATT service advertised by every mesh node
pub const SERVICE_UUID: &str = "12345678-1234-1234-1234-123456789ABC";

/// Characteristic carrying mesh frames
pub const MESSAGE_CHARACTERISTIC_UUID: &str = "12345678-1234-1234-1234-123456789ABD";

/// Characteristic reserved for location reports
pub const LOCATION_CHARACTERISTIC_UUID: &str = "12345678-1234-1234-1234-123456789ABE";

/// Maximum encoded frame size (BLE attribute value limit)
pub const MAX_FRAME_SIZE: usize = 512;

/// Separator between frame fields
pub const FIELD_SEPARATOR: char = '|';

/// Advertised-name prefix of an admin node
pub const ADMIN_NAME_TAG: &str = "A:";

/// Advertised-name prefix of a user node
pub const USER_NAME_TAG: &str = "U:";

/// Name put on the air: the advertiser's role tag, then its visible name
pub fn advertised_name(role: Role, visible_name: &str) -> String {
    let tag = match role {
        Role::Admin => ADMIN_NAME_TAG,
        Role::User => USER_NAME_TAG,
    };
    format!("{tag}{visible_name}")
}

/// Split an advertised name into the advertiser's role and its visible name.
/// Untagged names (foreign or older nodes) have no role.
pub fn parse_advertised_name(name: &str) -> (Option<Role>, &str) {
    if let Some(visible) = name.strip_prefix(ADMIN_NAME_TAG) {
        (Some(Role::Admin), visible)
    } else if let Some(visible) = name.strip_prefix(USER_NAME_TAG) {
        (Some(Role::User), visible)
    } else {
        (None, name)
    }
}

/// Parsed service identifier
pub fn service_uuid() -> Uuid {
    Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc)
}

/// Parsed message characteristic identifier
pub fn message_characteristic_uuid() -> Uuid {
    Uuid::from_u128(0x12345678_1234_1234_1234_123456789abd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_ids_match_string_constants() {
        assert_eq!(service_uuid(), Uuid::parse_str(SERVICE_UUID).unwrap());
        assert_eq!(
            message_characteristic_uuid(),
            Uuid::parse_str(MESSAGE_CHARACTERISTIC_UUID).unwrap()
        );
        assert_ne!(
            message_characteristic_uuid(),
            Uuid::parse_str(LOCATION_CHARACTERISTIC_UUID).unwrap()
        );
    }

    #[test]
    fn advertised_names_carry_the_role() {
        let admin = advertised_name(Role::Admin, "Base");
        let user = advertised_name(Role::User, "Field 1");

        assert_eq!(parse_advertised_name(&admin), (Some(Role::Admin), "Base"));
        assert_eq!(parse_advertised_name(&user), (Some(Role::User), "Field 1"));
        assert_eq!(parse_advertised_name("Pixel 7"), (None, "Pixel 7"));
        assert_eq!(parse_advertised_name("A:"), (Some(Role::Admin), ""));
    }
}
