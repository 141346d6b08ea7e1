use std::path::Path;
use log::{debug, info, warn};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::to_hex;
use crate::error::UhidError;
use crate::uhid::frames::{
    encode_create2, encode_destroy, encode_input2, parse_kernel_event, substitute_report_id,
    KernelEvent, BUS_BLUETOOTH, EVENT_BUF_LEN,
};

/// One open handle to the kernel virtual-HID channel. At most one exists per
/// active session; it is created once the report descriptor is known and
/// destroyed on teardown.
pub struct VirtualHidDevice {
    file: File,
    path: String,
    cancel: CancellationToken,
    drain_handle: Option<JoinHandle<()>>,
    created: bool,
}

impl VirtualHidDevice {
    pub async fn open(path: &Path, cancel: &CancellationToken) -> Result<Self, UhidError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|source| UhidError::Open { path: path.display().to_string(), source })?;

        Ok(VirtualHidDevice {
            file,
            path: path.display().to_string(),
            cancel: cancel.child_token(),
            drain_handle: None,
            created: false,
        })
    }

    pub async fn create(
        &mut self,
        name: &str,
        phys: &str,
        vendor: u32,
        product: u32,
        version: u32,
        descriptor: &[u8],
    ) -> Result<(), UhidError> {
        let frame = encode_create2(name, phys, "", BUS_BLUETOOTH, vendor, product, version, 0, descriptor)?;
        self.write_frame(&frame).await?;
        self.created = true;
        info!("Created virtual input device {:?} on {} ({} byte descriptor)", name, self.path, descriptor.len());

        // The kernel pushes acknowledgement/control frames back over the same
        // channel; they must be drained or the kernel side can stall.
        let reader = self.file.try_clone().await?;
        self.drain_handle = Some(drain_kernel_events(self.cancel.clone(), reader));

        Ok(())
    }

    pub async fn send_input(&mut self, report: &[u8]) -> Result<(), UhidError> {
        let payload = substitute_report_id(report);
        let frame = encode_input2(&payload)?;
        self.write_frame(&frame).await
    }

    pub async fn destroy(&mut self) {
        if self.created {
            if let Err(err) = self.write_frame(&encode_destroy()).await {
                warn!("Failed to send destroy frame: {}", err);
            }
            self.created = false;
            info!("Destroyed virtual input device on {}", self.path);
        }

        self.cancel.cancel();
        if let Some(handle) = self.drain_handle.take() {
            // the drain task may be parked in a read that never completes now
            handle.abort();
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), UhidError> {
        // A single write; the kernel consumes frames whole. write_all would
        // paper over a partial write, which is a protocol violation here.
        let written = self.file.write(frame).await?;
        if written != frame.len() {
            return Err(UhidError::ShortWrite { written, expected: frame.len() });
        }
        self.file.flush().await?;
        Ok(())
    }
}

fn drain_kernel_events(cancel: CancellationToken, mut reader: File) -> JoinHandle<()> {
    spawn(async move {
        let mut buf = vec![0u8; EVENT_BUF_LEN];

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                result = reader.read(&mut buf) => {
                    let n = match result {
                        Ok(0) => break 'mainloop,
                        Ok(n) => n,
                        Err(err) => {
                            warn!("Error reading kernel events: {}", err);
                            break 'mainloop;
                        },
                    };

                    match parse_kernel_event(&buf[..n]) {
                        Some(KernelEvent::Start) => debug!("Kernel started using the device"),
                        Some(KernelEvent::Stop) => debug!("Kernel stopped using the device"),
                        Some(KernelEvent::Open) => debug!("An application opened the device"),
                        Some(KernelEvent::Close) => debug!("An application closed the device"),
                        Some(KernelEvent::Output { data }) => {
                            debug!("Output report from kernel: {}", to_hex(&data));
                        },
                        Some(KernelEvent::GetReport) => debug!("Kernel requested a report"),
                        Some(KernelEvent::SetReport) => debug!("Kernel set a report"),
                        Some(KernelEvent::Unknown(tag)) => warn!("Unknown kernel event tag {}", tag),
                        None => warn!("Runt kernel event ({} bytes)", n),
                    }
                },
            }
        }
    })
}
