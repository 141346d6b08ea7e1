//! Default link backend on top of the platform BLE stack.
//!
//! Pairing, encryption and bonding-key storage are owned by the platform
//! daemon here: `begin_secure_session` only hands the link over and the bond
//! store queries answer conservatively. Backends that expose their security
//! manager directly (or that can observe controller corruption) implement the
//! same traits with real answers.
//!
//! Attribute handles are synthetic: the platform stack keys attributes by
//! uuid, so this backend numbers every service, characteristic and descriptor
//! in discovery order. The ordering is deterministic per remote, which keeps
//! cached handles valid across reconnects. Twin characteristics sharing a
//! uuid cannot be told apart on the notification path; the first handle wins.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Descriptor, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{LinkError, SecureSessionError};
use crate::link::{
    Address, CharacteristicRef, ConnectOutcome, DescriptorRef, DisconnectReason, Link,
    Notification, Radio, RadioFactory, ServiceRef,
};

/**
 * How often (milliseconds) to re-check the scan results for the target.
 */
const SCAN_POLL_DELAY: u64 = 500;

fn to_link_err(err: btleplug::Error) -> LinkError {
    LinkError::Transport(err.to_string())
}

pub struct BtleRadioFactory;

impl RadioFactory for BtleRadioFactory {
    type Radio = BtleRadio;

    async fn open_radio(&self) -> Result<BtleRadio, LinkError> {
        let manager = Manager::new().await.map_err(to_link_err)?;
        let adapters = manager.adapters().await.map_err(to_link_err)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Transport("no bluetooth adapter available".to_string()))?;

        info!(
            "Using adapter {}",
            adapter.adapter_info().await.unwrap_or_else(|_| "UNKNOWN".to_string())
        );

        Ok(BtleRadio { adapter })
    }
}

pub struct BtleRadio {
    adapter: Adapter,
}

impl BtleRadio {
    async fn find_peripheral(&self, target: &BDAddr) -> Option<Peripheral> {
        let peripherals = match self.adapter.peripherals().await {
            Ok(peripherals) => peripherals,
            Err(err) => {
                warn!("Failed to query adapter for peripherals: {}", err);
                return None;
            },
        };

        for peripheral in peripherals {
            match peripheral.properties().await {
                Ok(Some(properties)) if properties.address == *target => {
                    info!(
                        "Found {} {:?}",
                        properties.address,
                        properties.local_name.unwrap_or_else(|| "NONE".to_string()),
                    );
                    return Some(peripheral);
                },
                Ok(_) => {},
                Err(err) => warn!("Could not query peripheral properties: {:?}", err),
            }
        }

        None
    }
}

impl Radio for BtleRadio {
    type Link = BtleLink;

    async fn connect(
        &mut self,
        address: &Address,
        timeout: Duration,
    ) -> Result<ConnectOutcome<BtleLink>, LinkError> {
        let deadline = Instant::now() + timeout;
        let target = BDAddr::from_str(&address.to_string())
            .map_err(|err| LinkError::Transport(err.to_string()))?;

        self.adapter
            .start_scan(ScanFilter { services: vec![] })
            .await
            .map_err(to_link_err)?;

        let peripheral = loop {
            if let Some(peripheral) = self.find_peripheral(&target).await {
                break peripheral;
            }
            if Instant::now() >= deadline {
                let _ = self.adapter.stop_scan().await;
                return Ok(ConnectOutcome::TimedOut);
            }
            sleep(Duration::from_millis(SCAN_POLL_DELAY)).await;
        };

        let _ = self.adapter.stop_scan().await;

        tokio::select! {
            _ = sleep_until(deadline) => {
                return Ok(ConnectOutcome::TimedOut);
            },
            result = peripheral.connect() => {
                result.map_err(to_link_err)?;
            },
        }

        BtleLink::new(self.adapter.clone(), peripheral).await.map(ConnectOutcome::Connected)
    }

    fn has_prior_bonding(&self, _address: &Address) -> bool {
        // the platform owns the bond store and restores bonds on its own
        false
    }

    fn purge_bonding(&mut self, address: &Address) {
        debug!("Bond purge for {} delegated to the platform", address);
    }

    async fn close(&mut self) {
        let _ = self.adapter.stop_scan().await;
    }
}

#[derive(Default)]
struct AttributeTable {
    services: Vec<ServiceRef>,
    characteristics: Vec<(u16, CharacteristicRef, Characteristic)>,
    descriptors: Vec<(u16, DescriptorRef, Descriptor)>,
}

pub struct BtleLink {
    peripheral: Peripheral,
    table: AttributeTable,
    notify_handles: Arc<Mutex<HashMap<Uuid, u16>>>,
    notifications: Option<mpsc::Receiver<Notification>>,
    disconnect: Option<oneshot::Receiver<DisconnectReason>>,
    tasks_cancel: CancellationToken,
}

impl BtleLink {
    async fn new(adapter: Adapter, peripheral: Peripheral) -> Result<BtleLink, LinkError> {
        let tasks_cancel = CancellationToken::new();
        let notify_handles: Arc<Mutex<HashMap<Uuid, u16>>> = Arc::new(Mutex::new(HashMap::new()));

        let disconnect = watch_disconnect(&adapter, &peripheral, tasks_cancel.clone()).await?;
        let notifications =
            forward_notifications(&peripheral, Arc::clone(&notify_handles), tasks_cancel.clone())
                .await?;

        Ok(BtleLink {
            peripheral,
            table: AttributeTable::default(),
            notify_handles,
            notifications: Some(notifications),
            disconnect: Some(disconnect),
            tasks_cancel,
        })
    }

    fn characteristic_by_handle(&self, handle: u16) -> Option<&Characteristic> {
        self.table
            .characteristics
            .iter()
            .find(|(entry_handle, _, _)| *entry_handle == handle)
            .map(|(_, _, characteristic)| characteristic)
    }

    fn descriptor_by_handle(&self, handle: u16) -> Option<&Descriptor> {
        self.table
            .descriptors
            .iter()
            .find(|(entry_handle, _, _)| *entry_handle == handle)
            .map(|(_, _, descriptor)| descriptor)
    }
}

impl Link for BtleLink {
    async fn begin_secure_session(&mut self, reuse_bond: bool) -> Result<(), SecureSessionError> {
        // Pairing and encryption are initiated by the platform when the first
        // protected attribute is touched; nothing to drive from here.
        debug!("Secure session delegated to the platform (reuse_bond: {})", reuse_bond);
        Ok(())
    }

    async fn discover_services(&mut self) -> Result<Vec<ServiceRef>, LinkError> {
        self.peripheral.discover_services().await.map_err(to_link_err)?;

        // One walk populates the whole synthetic-handle table; the per-
        // service accessors below answer from it without extra round-trips.
        let mut table = AttributeTable::default();
        let mut next_handle: u16 = 1;
        let mut notify_handles = HashMap::new();

        for service in self.peripheral.services() {
            let service_handle = next_handle;
            next_handle += 1;
            table.services.push(ServiceRef { uuid: service.uuid, handle: service_handle });

            for characteristic in &service.characteristics {
                let characteristic_handle = next_handle;
                next_handle += 1;
                notify_handles.entry(characteristic.uuid).or_insert(characteristic_handle);

                for descriptor in &characteristic.descriptors {
                    let descriptor_ref = DescriptorRef { uuid: descriptor.uuid, handle: next_handle };
                    next_handle += 1;
                    table.descriptors.push((characteristic_handle, descriptor_ref, descriptor.clone()));
                }

                let characteristic_ref = CharacteristicRef {
                    uuid: characteristic.uuid,
                    handle: characteristic_handle,
                    properties: characteristic.properties.bits(),
                };
                table.characteristics.push((service_handle, characteristic_ref, characteristic.clone()));
            }
        }

        *self.notify_handles.lock().expect("notify handle map poisoned") = notify_handles;
        self.table = table;

        Ok(self.table.services.clone())
    }

    async fn discover_characteristics(
        &mut self,
        service: &ServiceRef,
    ) -> Result<Vec<CharacteristicRef>, LinkError> {
        Ok(self
            .table
            .characteristics
            .iter()
            .filter(|(service_handle, _, _)| *service_handle == service.handle)
            .map(|(_, characteristic_ref, _)| characteristic_ref.clone())
            .collect())
    }

    async fn discover_descriptors(
        &mut self,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<DescriptorRef>, LinkError> {
        Ok(self
            .table
            .descriptors
            .iter()
            .filter(|(characteristic_handle, _, _)| *characteristic_handle == characteristic.handle)
            .map(|(_, descriptor_ref, _)| descriptor_ref.clone())
            .collect())
    }

    async fn read_value(&mut self, handle: u16) -> Result<Vec<u8>, LinkError> {
        if let Some(characteristic) = self.characteristic_by_handle(handle) {
            return self.peripheral.read(characteristic).await.map_err(to_link_err);
        }
        if let Some(descriptor) = self.descriptor_by_handle(handle) {
            return self.peripheral.read_descriptor(descriptor).await.map_err(to_link_err);
        }
        Err(LinkError::MissingAttribute)
    }

    async fn subscribe(&mut self, characteristic: &CharacteristicRef) -> Result<(), LinkError> {
        match self.characteristic_by_handle(characteristic.handle) {
            Some(entry) => self.peripheral.subscribe(entry).await.map_err(to_link_err),
            None => Err(LinkError::MissingAttribute),
        }
    }

    fn take_notifications(&mut self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications.take()
    }

    fn take_disconnect(&mut self) -> Option<oneshot::Receiver<DisconnectReason>> {
        self.disconnect.take()
    }

    async fn disconnect(&mut self) {
        self.tasks_cancel.cancel();
        if let Err(err) = self.peripheral.disconnect().await {
            debug!("Disconnect failed (link may already be down): {}", err);
        }
    }
}

async fn watch_disconnect(
    adapter: &Adapter,
    peripheral: &Peripheral,
    cancel: CancellationToken,
) -> Result<oneshot::Receiver<DisconnectReason>, LinkError> {
    let mut events = adapter.events().await.map_err(to_link_err)?;
    let id = peripheral.id();
    let (sender, receiver) = oneshot::channel();

    spawn(async move {
        let mut sender = Some(sender);
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(other)) if other == id => {
                        if let Some(sender) = sender.take() {
                            // the platform reports no reason code
                            let _ = sender.send(0);
                        }
                        break 'mainloop;
                    },
                    Some(_) => {},
                    None => break 'mainloop,
                },
            }
        }
    });

    Ok(receiver)
}

async fn forward_notifications(
    peripheral: &Peripheral,
    notify_handles: Arc<Mutex<HashMap<Uuid, u16>>>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<Notification>, LinkError> {
    let mut stream = peripheral.notifications().await.map_err(to_link_err)?;
    let (mut sender, receiver) = mpsc::channel::<Notification>(64);

    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                data = stream.next() => match data {
                    Some(data) => {
                        let handle = notify_handles
                            .lock()
                            .expect("notify handle map poisoned")
                            .get(&data.uuid)
                            .copied()
                            .unwrap_or(0);

                        let notification = Notification { handle, value: data.value };
                        if sender.send(notification).await.is_err() {
                            break 'mainloop;
                        }
                    },
                    None => break 'mainloop,
                },
            }
        }
    });

    Ok(receiver)
}
