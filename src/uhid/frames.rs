//! Wire framing for the kernel virtual-HID character device.
//!
//! All frames are fixed-size and little-endian, matching the kernel ABI:
//! a create frame is the 4-byte event tag, a 128-byte zero-padded device
//! name, 64-byte zero-padded "phys" and "uniq" identifiers, descriptor
//! size/bus/vendor/product/version/country fields, and the report descriptor
//! zero-padded to 4096 bytes. An input frame is the tag, a 2-byte payload
//! length, and the payload zero-padded to 4096 bytes. A destroy frame is the
//! tag alone.

use crate::error::UhidError;

pub const EVENT_DESTROY: u32 = 1;
pub const EVENT_START: u32 = 2;
pub const EVENT_STOP: u32 = 3;
pub const EVENT_OPEN: u32 = 4;
pub const EVENT_CLOSE: u32 = 5;
pub const EVENT_OUTPUT: u32 = 6;
pub const EVENT_GET_REPORT: u32 = 9;
pub const EVENT_CREATE2: u32 = 11;
pub const EVENT_INPUT2: u32 = 12;
pub const EVENT_SET_REPORT: u32 = 13;

pub const NAME_LEN: usize = 128;
pub const PHYS_LEN: usize = 64;
pub const UNIQ_LEN: usize = 64;
pub const DATA_MAX: usize = 4096;

/// Large enough for any kernel-side event.
pub const EVENT_BUF_LEN: usize = 4380;

pub const BUS_BLUETOOTH: u16 = 0x05;

/// Report id 0 is invalid in the kernel's numbering scheme; outbound payloads
/// that lead with it are rewritten to this reserved id instead. The rewrite
/// is deterministic and reversible on paper (0x07 in an outbound frame always
/// means the remote said 0x00), though nothing reverses it in practice. Id 7
/// is reserved because the shipped report descriptors declare a button report
/// under that id.
pub const REPORT_ID_SUBSTITUTE: u8 = 0x07;

fn put_padded(frame: &mut Vec<u8>, text: &str, len: usize) {
    let bytes = text.as_bytes();
    // keep room for at least one NUL terminator
    let take = bytes.len().min(len - 1);
    frame.extend_from_slice(&bytes[..take]);
    frame.resize(frame.len() + (len - take), 0);
}

#[allow(clippy::too_many_arguments)]
pub fn encode_create2(
    name: &str,
    phys: &str,
    uniq: &str,
    bus: u16,
    vendor: u32,
    product: u32,
    version: u32,
    country: u32,
    descriptor: &[u8],
) -> Result<Vec<u8>, UhidError> {
    if descriptor.len() > DATA_MAX {
        return Err(UhidError::OversizedPayload { len: descriptor.len(), max: DATA_MAX });
    }

    let mut frame = Vec::with_capacity(4 + NAME_LEN + PHYS_LEN + UNIQ_LEN + 20 + DATA_MAX);
    frame.extend_from_slice(&EVENT_CREATE2.to_le_bytes());
    put_padded(&mut frame, name, NAME_LEN);
    put_padded(&mut frame, phys, PHYS_LEN);
    put_padded(&mut frame, uniq, UNIQ_LEN);
    frame.extend_from_slice(&(descriptor.len() as u16).to_le_bytes());
    frame.extend_from_slice(&bus.to_le_bytes());
    frame.extend_from_slice(&vendor.to_le_bytes());
    frame.extend_from_slice(&product.to_le_bytes());
    frame.extend_from_slice(&version.to_le_bytes());
    frame.extend_from_slice(&country.to_le_bytes());
    frame.extend_from_slice(descriptor);
    frame.resize(frame.len() + (DATA_MAX - descriptor.len()), 0);

    Ok(frame)
}

pub fn encode_input2(payload: &[u8]) -> Result<Vec<u8>, UhidError> {
    if payload.len() > DATA_MAX {
        return Err(UhidError::OversizedPayload { len: payload.len(), max: DATA_MAX });
    }

    let mut frame = Vec::with_capacity(4 + 2 + DATA_MAX);
    frame.extend_from_slice(&EVENT_INPUT2.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.resize(frame.len() + (DATA_MAX - payload.len()), 0);

    Ok(frame)
}

pub fn encode_destroy() -> [u8; 4] {
    EVENT_DESTROY.to_le_bytes()
}

/// Apply the report-id rewrite to an outbound input payload.
pub fn substitute_report_id(report: &[u8]) -> Vec<u8> {
    let mut payload = report.to_vec();
    if payload.first() == Some(&0) {
        payload[0] = REPORT_ID_SUBSTITUTE;
    }
    payload
}

/// Events the kernel side emits back over the same channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    Start,
    Stop,
    Open,
    Close,
    Output { data: Vec<u8> },
    GetReport,
    SetReport,
    Unknown(u32),
}

pub fn parse_kernel_event(buf: &[u8]) -> Option<KernelEvent> {
    if buf.len() < 4 {
        return None;
    }

    let tag = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let event = match tag {
        EVENT_START => KernelEvent::Start,
        EVENT_STOP => KernelEvent::Stop,
        EVENT_OPEN => KernelEvent::Open,
        EVENT_CLOSE => KernelEvent::Close,
        EVENT_OUTPUT => {
            // tag, data[DATA_MAX], u16 size, u8 rtype
            let data = if buf.len() >= 4 + DATA_MAX + 2 {
                let size = u16::from_le_bytes([buf[4 + DATA_MAX], buf[4 + DATA_MAX + 1]]) as usize;
                buf[4..4 + size.min(DATA_MAX)].to_vec()
            } else {
                vec![]
            };
            KernelEvent::Output { data }
        },
        EVENT_GET_REPORT => KernelEvent::GetReport,
        EVENT_SET_REPORT => KernelEvent::SetReport,
        other => KernelEvent::Unknown(other),
    };

    Some(event)
}
