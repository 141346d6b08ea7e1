mod ble_m3;
mod beauty_r1;

/// Device-independent button codes. Scripts and the action map are bound to
/// these, not to raw hardware state bytes.
pub const BUTTON_LEFT: u8 = 0x01;
pub const BUTTON_UP: u8 = 0x02;
pub const BUTTON_RIGHT: u8 = 0x04;
pub const BUTTON_DOWN: u8 = 0x08;
pub const BUTTON_CENTER: u8 = 0x10;
pub const BUTTON_ENTER: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub code: u8,
    pub name: &'static str,
}

/// Closed set of supported remote families. Each variant carries its own
/// empirical decoding strategy; the shared contract is the fallback ordering:
/// direct table, then movement disambiguation, then first-set-bit, then noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperVariant {
    BleM3,
    BeautyR1,
}

/// Evaluated in priority order against a lowercased device name. The first
/// registered variant doubles as the default when no name is known or nothing
/// matches.
const REGISTRY: &[(&str, MapperVariant)] = &[
    ("ble-m3", MapperVariant::BleM3),
    ("beauty-r1", MapperVariant::BeautyR1),
];

pub fn select_mapper(device_name: Option<&str>) -> MapperVariant {
    let default = REGISTRY[0].1;

    let name = match device_name {
        Some(name) => name.to_lowercase(),
        None => return default,
    };

    for (pattern, variant) in REGISTRY {
        if name.contains(pattern) {
            return *variant;
        }
    }

    default
}

impl MapperVariant {
    pub fn label(&self) -> &'static str {
        match self {
            MapperVariant::BleM3 => "BLE-M3",
            MapperVariant::BeautyR1 => "BEAUTY-R1",
        }
    }

    /// Decode a raw report's state byte plus movement deltas into a canonical
    /// button, or None for noise. Movement bytes are two's-complement signed.
    pub fn decode(&self, state: u8, x: u8, y: u8) -> Option<ButtonEvent> {
        match self {
            MapperVariant::BleM3 => ble_m3::decode(state, x, y),
            MapperVariant::BeautyR1 => beauty_r1::decode(state, x, y),
        }
    }

    /// Release frames carry no button identity and must never reach decode.
    pub fn is_release(&self, state: u8) -> bool {
        state == 0
    }
}

const BIT_NAMES: [&str; 8] = [
    "Button (bit 0)",
    "Button (bit 1)",
    "Button (bit 2)",
    "Button (bit 3)",
    "Button (bit 4)",
    "Button (bit 5)",
    "Button (bit 6)",
    "Button (bit 7)",
];

/// Last resort for unrecognized state bytes: the first set bit names the
/// button. A zero state yields nothing.
fn first_set_bit(state: u8) -> Option<ButtonEvent> {
    for i in 0..8usize {
        let mask = 1u8 << i;
        if state & mask != 0 {
            return Some(ButtonEvent { code: mask, name: BIT_NAMES[i] });
        }
    }
    None
}
