//! Bluetooth UUIDs for caremon wearables.
//!
//! The wearable exposes an aggregate health service with one characteristic
//! per metric. Devices without it are expected to expose at least the
//! standard GATT Heart Rate service.

use uuid::{Uuid, uuid};

// --- Caremon aggregate health service ---

/// Aggregate health service carrying every metric channel.
pub const HEALTH_SERVICE: Uuid = uuid!("a3c80001-7d2f-4c1e-9b6a-52e0f1d4c900");

/// Heart rate channel (beats per minute).
pub const HEALTH_HEART_RATE: Uuid = uuid!("a3c80101-7d2f-4c1e-9b6a-52e0f1d4c900");

/// Battery level channel (percent).
pub const HEALTH_BATTERY: Uuid = uuid!("a3c80102-7d2f-4c1e-9b6a-52e0f1d4c900");

/// Skin temperature channel (degrees Celsius).
pub const HEALTH_TEMPERATURE: Uuid = uuid!("a3c80103-7d2f-4c1e-9b6a-52e0f1d4c900");

/// Step counter channel.
pub const HEALTH_STEPS: Uuid = uuid!("a3c80104-7d2f-4c1e-9b6a-52e0f1d4c900");

/// Blood oxygen saturation channel (percent).
pub const HEALTH_OXYGEN_SATURATION: Uuid = uuid!("a3c80105-7d2f-4c1e-9b6a-52e0f1d4c900");

/// Manufacturer ID used in the wearable's advertisements.
pub const MANUFACTURER_ID: u16 = 0x0C4E;

/// Advertised name prefix of caremon wearables.
pub const DEVICE_NAME_PREFIX: &str = "CareMonitor";

/// Lowercase substrings that mark a characteristic description as a motion channel.
pub const MOTION_NAME_PATTERNS: [&str; 3] = ["motion", "accel", "movement"];

// --- Standard BLE Service UUIDs ---

/// Heart Rate service.
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

// --- Standard BLE Characteristic UUIDs ---

/// Heart Rate Measurement characteristic (flags byte + u8/u16 value).
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");

/// Battery Level characteristic (u8 percent).
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

/// Serial Number String characteristic.
pub const SERIAL_NUMBER: Uuid = uuid!("00002a25-0000-1000-8000-00805f9b34fb");

// --- Descriptors ---

/// Characteristic User Description descriptor.
pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = uuid!("00002901-0000-1000-8000-00805f9b34fb");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_channels_are_distinct() {
        let channels = [
            HEALTH_HEART_RATE,
            HEALTH_BATTERY,
            HEALTH_TEMPERATURE,
            HEALTH_STEPS,
            HEALTH_OXYGEN_SATURATION,
        ];
        for (i, a) in channels.iter().enumerate() {
            for b in &channels[i + 1..] {
                assert_ne!(a, b);
            }
            assert_ne!(*a, HEALTH_SERVICE);
        }
    }

    #[test]
    fn test_standard_uuid_format() {
        assert!(HEART_RATE_MEASUREMENT.to_string().starts_with("00002a37"));
        assert!(HEART_RATE_SERVICE.to_string().starts_with("0000180d"));
    }
}
