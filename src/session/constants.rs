use uuid::Uuid;

/**
 * Expand a 16-bit Bluetooth SIG id into the full 128-bit form.
 */
const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x00000000_0000_1000_8000_00805F9B34FB | ((short as u128) << 96))
}

pub const GENERIC_ACCESS_SERVICE: Uuid = bluetooth_uuid(0x1800);
pub const DEVICE_NAME_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2A00);

/**
 * HID-over-GATT service and characteristics (Bluetooth SIG assigned numbers).
 */
pub const HID_SERVICE: Uuid = bluetooth_uuid(0x1812);
pub const HID_INFORMATION_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2A4A);
pub const HID_REPORT_MAP_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2A4B);
pub const HID_REPORT_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2A4D);

pub const REPORT_REFERENCE_DESCRIPTOR: Uuid = bluetooth_uuid(0x2908);

/**
 * Report type field of a Report Reference descriptor.
 */
pub const HID_REPORT_TYPE_INPUT: u8 = 1;
