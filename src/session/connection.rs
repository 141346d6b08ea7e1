use futures::StreamExt;
use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actions::ActionMap;
use crate::cache::{to_hex, AttributeCache, CacheUpdate, CachedCharacteristic, ReportReference};
use crate::config::Config;
use crate::debounce::Debouncer;
use crate::error::{LinkError, SecureSessionError};
use crate::link::{Address, CharacteristicRef, ConnectOutcome, Link, Notification, Radio, ServiceRef};
use crate::mapper::{select_mapper, MapperVariant};
use crate::session::constants::{
    DEVICE_NAME_CHARACTERISTIC, GENERIC_ACCESS_SERVICE, HID_INFORMATION_CHARACTERISTIC,
    HID_REPORT_CHARACTERISTIC, HID_REPORT_MAP_CHARACTERISTIC, HID_SERVICE,
    HID_REPORT_TYPE_INPUT, REPORT_REFERENCE_DESCRIPTOR,
};
use crate::session::types::{CycleOutcome, ReportBinding, SessionState};
use crate::uhid::{forward_report, VirtualHidDevice};

/// Per-remote connection state machine. One cycle runs
/// Connecting → SecuringSession → DiscoveringServices → Subscribing → Active
/// → TearingDown; the supervisor decides if and when the next cycle starts.
pub struct ConnectionSession<'a> {
    address: Address,
    config: &'a Config,
    cache: AttributeCache,
    actions: &'a ActionMap,
    cancel: CancellationToken,
    state: SessionState,
}

/// Everything `establish` produced that `serve` needs. Dropping it releases
/// the report bindings along with the link.
pub struct Established<L> {
    link: L,
    bindings: Vec<ReportBinding>,
    mapper: MapperVariant,
    report_descriptor: Option<Vec<u8>>,
    device_name: Option<String>,
}

struct Discovery {
    bindings: Vec<ReportBinding>,
    report_descriptor: Option<Vec<u8>>,
    device_name: Option<String>,
}

impl<'a> ConnectionSession<'a> {
    pub fn new(
        address: Address,
        config: &'a Config,
        cache: AttributeCache,
        actions: &'a ActionMap,
        cancel: CancellationToken,
    ) -> Self {
        ConnectionSession {
            address,
            config,
            cache,
            actions,
            cancel,
            state: SessionState::Disconnected,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("[{}] {} -> {}", self.address, self.state, state);
            self.state = state;
        }
    }

    /// The establishment phases, up to and including subscription. The
    /// supervisor bounds this whole call with the establishment timeout;
    /// the Active phase afterwards is deliberately unbounded.
    pub async fn establish<R: Radio>(
        &mut self,
        radio: &mut R,
    ) -> Result<Established<R::Link>, CycleOutcome> {
        self.set_state(SessionState::Connecting);
        info!("[{}] Connecting...", self.address);

        let connect_timeout = self.config.connection.connect_timeout();
        let mut link = match radio.connect(&self.address, connect_timeout).await {
            Ok(ConnectOutcome::Connected(link)) => link,
            Ok(ConnectOutcome::TimedOut) => {
                info!(
                    "[{}] No answer within {}s (remote may be off or out of range)",
                    self.address, self.config.connection.connect_timeout_secs
                );
                self.set_state(SessionState::Disconnected);
                return Err(CycleOutcome::ConnectTimeout);
            },
            Err(err) => {
                self.set_state(SessionState::Disconnected);
                return Err(CycleOutcome::LinkFailed(err));
            },
        };
        info!("[{}] Connected", self.address);

        self.set_state(SessionState::SecuringSession);
        if let Err(outcome) = self.secure(radio, &mut link).await {
            return Err(self.abort_establish(link, outcome).await);
        }

        self.set_state(SessionState::DiscoveringServices);
        let discovery = match self.discover(&mut link).await {
            Ok(discovery) => discovery,
            Err(outcome) => return Err(self.abort_establish(link, outcome).await),
        };

        self.set_state(SessionState::Subscribing);
        self.subscribe_bindings(&mut link, &discovery.bindings).await;

        let mapper = select_mapper(discovery.device_name.as_deref());

        Ok(Established {
            link,
            bindings: discovery.bindings,
            mapper,
            report_descriptor: discovery.report_descriptor,
            device_name: discovery.device_name,
        })
    }

    async fn abort_establish<L: Link>(&mut self, mut link: L, outcome: CycleOutcome) -> CycleOutcome {
        self.set_state(SessionState::TearingDown);
        link.disconnect().await;
        self.set_state(SessionState::Disconnected);
        outcome
    }

    /// The Active phase: relay reports until the link ends or the supervisor
    /// stops the session. The only unbounded wait in the whole cycle.
    pub async fn serve<L: Link>(&mut self, established: Established<L>) -> CycleOutcome {
        let Established { mut link, bindings, mapper, report_descriptor, device_name } = established;

        let mut notifications = match link.take_notifications() {
            Some(notifications) => notifications,
            None => {
                warn!("[{}] Link offered no notification stream", self.address);
                return self.abort_establish(link, CycleOutcome::LinkFailed(LinkError::MissingAttribute)).await;
            },
        };
        let mut disconnect = match link.take_disconnect() {
            Some(disconnect) => disconnect,
            None => {
                warn!("[{}] Link offered no disconnect signal", self.address);
                return self.abort_establish(link, CycleOutcome::LinkFailed(LinkError::MissingAttribute)).await;
            },
        };

        self.set_state(SessionState::Active);

        let mut uhid = match self.create_virtual_device(&report_descriptor, &device_name).await {
            Ok(uhid) => uhid,
            Err(outcome) => return self.abort_establish(link, outcome).await,
        };

        let mut debouncer = Debouncer::new(self.config.buttons.debounce());
        info!(
            "[{}] Receiving input reports ({} binding(s), mapper {})",
            self.address,
            bindings.len(),
            mapper.label()
        );

        let outcome = 'mainloop: loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("[{}] Session stop requested", self.address);
                    break 'mainloop CycleOutcome::Stopped;
                },
                reason = &mut disconnect => {
                    let reason = reason.ok();
                    warn!("[{}] Disconnected (reason: {:?})", self.address, reason);
                    break 'mainloop CycleOutcome::Disconnected { reason };
                },
                notification = notifications.next() => match notification {
                    Some(notification) => {
                        self.handle_report(&bindings, mapper, &mut debouncer, uhid.as_mut(), &notification).await;
                    },
                    None => {
                        warn!("[{}] Notification stream ended", self.address);
                        break 'mainloop CycleOutcome::Disconnected { reason: None };
                    },
                },
            }
        };

        self.set_state(SessionState::TearingDown);
        if let Some(device) = uhid.as_mut() {
            device.destroy().await;
        }
        self.actions.dispatch_link_ended();
        link.disconnect().await;
        self.set_state(SessionState::Disconnected);

        outcome
    }

    async fn secure<R: Radio>(&mut self, radio: &mut R, link: &mut R::Link) -> Result<(), CycleOutcome> {
        if radio.has_prior_bonding(&self.address) {
            info!("[{}] Re-establishing secure session from stored bond", self.address);
            match link.begin_secure_session(true).await {
                Ok(()) => {
                    info!("[{}] Bond restored", self.address);
                    return Ok(());
                },
                Err(SecureSessionError::ControllerCorrupted) => {
                    return Err(CycleOutcome::ControllerCorrupted);
                },
                Err(err) => {
                    warn!("[{}] Stored bond rejected ({}), purging and pairing fresh", self.address, err);
                    radio.purge_bonding(&self.address);
                },
            }
        }

        info!("[{}] Initiating pairing...", self.address);
        match link.begin_secure_session(false).await {
            Ok(()) => {
                info!("[{}] Pairing complete", self.address);
                Ok(())
            },
            Err(SecureSessionError::ControllerCorrupted) => Err(CycleOutcome::ControllerCorrupted),
            Err(err) => {
                warn!("[{}] Pairing failed: {}", self.address, err);
                Err(CycleOutcome::PairingFailed)
            },
        }
    }

    async fn discover<L: Link>(&mut self, link: &mut L) -> Result<Discovery, CycleOutcome> {
        let cached = self.cache.load(&self.address).await;

        let mut report_descriptor = cached.as_ref().and_then(|entry| entry.report_descriptor_bytes());
        let descriptor_was_cached = report_descriptor.is_some();
        if let Some(descriptor) = &report_descriptor {
            info!("[{}] Using cached report descriptor ({} bytes)", self.address, descriptor.len());
        }

        let mut device_name = cached.as_ref().and_then(|entry| entry.device_name.clone());
        let name_was_cached = device_name.is_some();

        // Even with a complete cache the service walk happens, to confirm the
        // service still exists on this link. Only the per-characteristic
        // round-trips are skipped.
        info!("[{}] Discovering services...", self.address);
        let services = link.discover_services().await?;

        let hid_service = match services.iter().find(|service| service.uuid == HID_SERVICE) {
            Some(service) => service.clone(),
            None => {
                warn!("[{}] HID service not found", self.address);
                return Err(CycleOutcome::LinkFailed(LinkError::MissingAttribute));
            },
        };

        if let Some(name) = &device_name {
            debug!("[{}] Device name: {} (cached)", self.address, name);
        } else {
            device_name = self.read_device_name(link, &services).await;
        }

        let restored = cached
            .as_ref()
            .and_then(|entry| entry.characteristics.as_deref())
            .and_then(reconstruct_characteristics);

        let (characteristics, from_cache) = match restored {
            Some(characteristics) => {
                info!("[{}] Restored {} characteristics from cache", self.address, characteristics.len());
                (characteristics, true)
            },
            None => {
                info!("[{}] Discovering characteristics...", self.address);
                let characteristics = link.discover_characteristics(&hid_service).await?;
                info!("[{}] Discovered {} characteristics", self.address, characteristics.len());
                (characteristics, false)
            },
        };

        let known_refs = cached.and_then(|entry| entry.report_refs).unwrap_or_default();
        let mut new_refs: IndexMap<String, ReportReference> = IndexMap::new();
        let mut bindings = vec![];

        for characteristic in &characteristics {
            debug!("[{}] Characteristic {}", self.address, characteristic.uuid);

            if characteristic.uuid == HID_INFORMATION_CHARACTERISTIC {
                // diagnostic only; not worth a round-trip on the cached path
                if !from_cache {
                    self.log_hid_information(link, characteristic).await;
                }
            } else if characteristic.uuid == HID_REPORT_MAP_CHARACTERISTIC {
                if report_descriptor.is_none() {
                    match link.read_value(characteristic.handle).await {
                        Ok(value) => {
                            info!("[{}] Report descriptor: {} bytes", self.address, value.len());
                            debug!("[{}] Report descriptor (hex): {}", self.address, to_hex(&value));
                            report_descriptor = Some(value);
                        },
                        Err(err) => warn!("[{}] Failed to read report descriptor: {}", self.address, err),
                    }
                }
            } else if characteristic.uuid == HID_REPORT_CHARACTERISTIC {
                let key = characteristic.handle.to_string();
                let reference = match known_refs.get(&key) {
                    Some(reference) => {
                        debug!(
                            "[{}] Report id {}, type {} (cached)",
                            self.address, reference.id, reference.kind
                        );
                        *reference
                    },
                    None => {
                        let reference = self.read_report_reference(link, characteristic).await;
                        new_refs.insert(key, reference);
                        reference
                    },
                };

                if reference.kind == HID_REPORT_TYPE_INPUT {
                    bindings.push(ReportBinding {
                        report_id: reference.id,
                        characteristic: characteristic.clone(),
                    });
                }
            }
        }

        // Persist whatever was newly learned. The update merges, so fields
        // from prior partial runs survive.
        let mut update = CacheUpdate::default();
        if !from_cache {
            update.characteristics = Some(characteristics.iter().map(to_cached).collect());
        }
        if !new_refs.is_empty() {
            update.report_refs = Some(new_refs);
        }
        if !descriptor_was_cached {
            update.report_descriptor = report_descriptor.as_deref().map(to_hex);
        }
        if !name_was_cached {
            update.device_name = device_name.clone();
        }

        let nothing_new = update.characteristics.is_none()
            && update.report_refs.is_none()
            && update.report_descriptor.is_none()
            && update.device_name.is_none();

        if nothing_new {
            info!("[{}] All attributes loaded from cache", self.address);
        } else if let Err(err) = self.cache.update(&self.address, update).await {
            warn!("[{}] Failed to update attribute cache: {}", self.address, err);
        }

        Ok(Discovery { bindings, report_descriptor, device_name })
    }

    async fn subscribe_bindings<L: Link>(&mut self, link: &mut L, bindings: &[ReportBinding]) {
        // Per-binding failures are logged and skipped: a partially working
        // remote beats none at all.
        for binding in bindings {
            match link.subscribe(&binding.characteristic).await {
                Ok(()) => info!("[{}] Subscribed to input report {}", self.address, binding.report_id),
                Err(err) => warn!(
                    "[{}] Failed to subscribe to report {}: {}",
                    self.address, binding.report_id, err
                ),
            }
        }
    }

    async fn handle_report(
        &self,
        bindings: &[ReportBinding],
        mapper: MapperVariant,
        debouncer: &mut Debouncer,
        uhid: Option<&mut VirtualHidDevice>,
        notification: &Notification,
    ) {
        if !bindings.iter().any(|binding| binding.characteristic.handle == notification.handle) {
            debug!("[{}] Notification from unbound handle {}", self.address, notification.handle);
            return;
        }

        let report = &notification.value;

        // Kernel forwarding runs independently of button decoding.
        if let Some(device) = uhid {
            let mode = self.config.uhid.forward_mode;
            if let Err(err) = forward_report(device, mode, mapper, report).await {
                warn!("[{}] Failed to forward report: {}", self.address, err);
            }
        }

        if report.len() < 2 {
            return;
        }

        let state = report[1];
        if mapper.is_release(state) {
            return;
        }

        let x = report.get(2).copied().unwrap_or(0);
        let y = report.get(3).copied().unwrap_or(0);

        let event = match mapper.decode(state, x, y) {
            Some(event) => event,
            None => {
                debug!(
                    "[{}] Unrecognized state byte 0x{:02x} (x:{:02x} y:{:02x})",
                    self.address, state, x, y
                );
                return;
            },
        };

        if !debouncer.admit() {
            return;
        }

        self.actions.dispatch(&event);
    }

    async fn create_virtual_device(
        &self,
        report_descriptor: &Option<Vec<u8>>,
        device_name: &Option<String>,
    ) -> Result<Option<VirtualHidDevice>, CycleOutcome> {
        if !self.config.uhid.enabled {
            return Ok(None);
        }

        let descriptor = match report_descriptor {
            Some(descriptor) => descriptor,
            None => {
                warn!("[{}] No report descriptor known, skipping virtual input device", self.address);
                return Ok(None);
            },
        };

        let uhid = &self.config.uhid;
        let mut device = match VirtualHidDevice::open(&uhid.path, &self.cancel).await {
            Ok(device) => device,
            Err(err) if err.is_fatal_for_session() => {
                return Err(CycleOutcome::Fatal(err.to_string()));
            },
            Err(err) => {
                warn!("[{}] Virtual input device unavailable: {}", self.address, err);
                return Ok(None);
            },
        };

        let name = format!("{} (pageflip)", device_name.as_deref().unwrap_or("Page Turner Remote"));
        let phys = format!("pageflip/{}", self.address);

        match device.create(&name, &phys, uhid.vendor_id, uhid.product_id, uhid.version, descriptor).await {
            Ok(()) => Ok(Some(device)),
            Err(err) => {
                warn!("[{}] Failed to create virtual input device: {}", self.address, err);
                Ok(None)
            },
        }
    }

    async fn read_device_name<L: Link>(&self, link: &mut L, services: &[ServiceRef]) -> Option<String> {
        let generic_access = services.iter().find(|service| service.uuid == GENERIC_ACCESS_SERVICE)?;

        let characteristics = match link.discover_characteristics(generic_access).await {
            Ok(characteristics) => characteristics,
            Err(err) => {
                warn!("[{}] Could not enumerate generic access service: {}", self.address, err);
                return None;
            },
        };

        let name_characteristic = characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == DEVICE_NAME_CHARACTERISTIC)?;

        match link.read_value(name_characteristic.handle).await {
            Ok(value) => {
                let name = String::from_utf8_lossy(&value).into_owned();
                info!("[{}] Device name: {}", self.address, name);
                Some(name)
            },
            Err(err) => {
                warn!("[{}] Could not read device name: {}", self.address, err);
                None
            },
        }
    }

    async fn log_hid_information<L: Link>(&self, link: &mut L, characteristic: &CharacteristicRef) {
        match link.read_value(characteristic.handle).await {
            Ok(value) if value.len() >= 4 => {
                let device_type = value[3] & 0x03;
                let type_name = match device_type {
                    1 => "keyboard",
                    2 => "mouse",
                    _ => "unknown",
                };
                debug!("[{}] HID information: device type {} (0x{:02x})", self.address, type_name, device_type);
            },
            Ok(value) => debug!("[{}] HID information too short ({} bytes)", self.address, value.len()),
            Err(err) => debug!("[{}] Failed to read HID information: {}", self.address, err),
        }
    }

    async fn read_report_reference<L: Link>(
        &self,
        link: &mut L,
        characteristic: &CharacteristicRef,
    ) -> ReportReference {
        // Missing or unreadable references default to report id 0, input
        // type, which matches what id-less remotes actually send.
        let mut reference = ReportReference { id: 0, kind: HID_REPORT_TYPE_INPUT };

        let descriptors = match link.discover_descriptors(characteristic).await {
            Ok(descriptors) => descriptors,
            Err(err) => {
                warn!("[{}] Descriptor discovery failed: {}", self.address, err);
                return reference;
            },
        };

        for descriptor in descriptors {
            if descriptor.uuid != REPORT_REFERENCE_DESCRIPTOR {
                continue;
            }

            match link.read_value(descriptor.handle).await {
                Ok(value) if value.len() >= 2 => {
                    reference = ReportReference { id: value[0], kind: value[1] };
                },
                Ok(value) => warn!("[{}] Report reference too short ({} bytes)", self.address, value.len()),
                Err(err) => warn!("[{}] Failed to read report reference: {}", self.address, err),
            }
        }

        debug!("[{}] Report id {}, type {}", self.address, reference.id, reference.kind);
        reference
    }
}

fn to_cached(characteristic: &CharacteristicRef) -> CachedCharacteristic {
    CachedCharacteristic {
        // full 128-bit hyphenated form, so reconstruction never guesses
        uuid: characteristic.uuid.to_string(),
        handle: characteristic.handle,
        properties: characteristic.properties,
    }
}

fn reconstruct_characteristics(cached: &[CachedCharacteristic]) -> Option<Vec<CharacteristicRef>> {
    if cached.is_empty() {
        return None;
    }

    cached
        .iter()
        .map(|characteristic| {
            let uuid = Uuid::parse_str(&characteristic.uuid).ok()?;
            Some(CharacteristicRef {
                uuid,
                handle: characteristic.handle,
                properties: characteristic.properties,
            })
        })
        .collect()
}
