//! Decoding strategy for the BEAUTY-R1 page-turner remote.
//!
//! Captured encodings:
//!   0x18               -> Up
//!   0x30 with x = 0x80 -> Left (full-scale negative x)
//!   0x30 otherwise     -> Down for x <= -30, Right for smaller magnitudes
//!                         (x:de/-34 vs x:e8/-24, x:f2/-14)
//!   0xd0               -> Down
//!   0x0f               -> Right
//!   0xf8               -> pre-signal chatter ahead of the real state byte
//!
//! The -30 split between Down and Right is empirical for this hardware
//! revision and intentionally not aligned with the BLE-M3 thresholds.

use super::{first_set_bit, ButtonEvent};
use super::{BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_UP};

pub(super) fn decode(state: u8, x: u8, _y: u8) -> Option<ButtonEvent> {
    let x_signed = x as i8;

    match state {
        0x18 => Some(ButtonEvent { code: BUTTON_UP, name: "Up" }),

        0x30 => {
            if x == 0x80 {
                Some(ButtonEvent { code: BUTTON_LEFT, name: "Left" })
            } else if x_signed <= -30 {
                Some(ButtonEvent { code: BUTTON_DOWN, name: "Down" })
            } else {
                Some(ButtonEvent { code: BUTTON_RIGHT, name: "Right" })
            }
        },

        0xd0 => Some(ButtonEvent { code: BUTTON_DOWN, name: "Down" }),
        0x0f => Some(ButtonEvent { code: BUTTON_RIGHT, name: "Right" }),

        // Suppressed before the first-bit fallback would misread it as Down.
        0xf8 => None,

        _ => first_set_bit(state),
    }
}
