//! BLE Service and Characteristic UUIDs.
//!
//! All instrument characteristics live in one vendor service and share the
//! suffix `-b042-4876-aae1-112855353cc1`.

use uuid::Uuid;

use crate::protocol::NotificationKind;

/// Instrument GATT service UUID.
pub const PARTECTOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x0bd51666_e7cb_469b_8e4d_2742f1ba77cc);

/// Standard measurement characteristic (notify).
pub const STD_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xe7add780_b042_4876_aae1_112855353cc1);
/// Auxiliary measurement characteristic (notify).
pub const AUX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xe7add781_b042_4876_aae1_112855353cc1);
/// Command characteristic (write).
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xe7add782_b042_4876_aae1_112855353cc1);
/// Command response characteristic (read).
pub const READ_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xe7add783_b042_4876_aae1_112855353cc1);
/// Size distribution characteristic (notify).
pub const SIZE_DIST_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xe7add784_b042_4876_aae1_112855353cc1);

/// Characteristic that carries notifications of `kind`.
pub fn notification_uuid(kind: NotificationKind) -> Uuid {
    match kind {
        NotificationKind::Std => STD_CHARACTERISTIC_UUID,
        NotificationKind::Aux => AUX_CHARACTERISTIC_UUID,
        NotificationKind::SizeDist => SIZE_DIST_CHARACTERISTIC_UUID,
    }
}

/// Notification kind of a characteristic, if it notifies at all.
pub fn notification_kind(uuid: &Uuid) -> Option<NotificationKind> {
    NotificationKind::ALL
        .into_iter()
        .find(|kind| notification_uuid(*kind) == *uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            PARTECTOR_SERVICE_UUID.to_string(),
            "0bd51666-e7cb-469b-8e4d-2742f1ba77cc"
        );
        assert_eq!(
            SIZE_DIST_CHARACTERISTIC_UUID.to_string(),
            "e7add784-b042-4876-aae1-112855353cc1"
        );
    }

    #[test]
    fn test_notification_mapping() {
        for kind in NotificationKind::ALL {
            assert_eq!(notification_kind(&notification_uuid(kind)), Some(kind));
        }
        assert_eq!(notification_kind(&WRITE_CHARACTERISTIC_UUID), None);
        assert_eq!(notification_kind(&READ_CHARACTERISTIC_UUID), None);
    }
}
