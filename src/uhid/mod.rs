pub mod frames;
mod device;

pub use device::VirtualHidDevice;

use serde::{Deserialize, Serialize};

use crate::error::UhidError;
use crate::mapper::MapperVariant;

/// How raw reports reach the kernel device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Forward the remote's report bytes unchanged.
    #[default]
    Passthrough,

    /// Decode the state byte, substitute the canonical button code, and
    /// follow up with a synthesized release frame (the remotes do not
    /// reliably emit their own releases).
    Legacy,
}

pub async fn forward_report(
    device: &mut VirtualHidDevice,
    mode: ForwardMode,
    mapper: MapperVariant,
    report: &[u8],
) -> Result<(), UhidError> {
    match mode {
        ForwardMode::Passthrough => device.send_input(report).await,

        ForwardMode::Legacy => {
            if report.len() < 2 {
                return Ok(());
            }

            let state = report[1];
            if mapper.is_release(state) {
                // dropped: the synthesized release after each press covers it
                return Ok(());
            }

            let x = report.get(2).copied().unwrap_or(0);
            let y = report.get(3).copied().unwrap_or(0);
            let event = match mapper.decode(state, x, y) {
                Some(event) => event,
                None => return Ok(()),
            };

            let mut press = report.to_vec();
            press[1] = event.code;
            device.send_input(&press).await?;

            let mut release = vec![0u8; press.len()];
            release[0] = press[0];
            device.send_input(&release).await
        },
    }
}
