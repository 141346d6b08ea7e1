//! Scripted in-memory link stack for exercising the session state machine
//! without hardware.

use std::collections::{HashMap, VecDeque};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use futures::channel::{mpsc, oneshot};

use pageflip::cache::parse_hex;
use pageflip::error::{LinkError, SecureSessionError};
use pageflip::link::{
    Address, CharacteristicRef, ConnectOutcome, DescriptorRef, DisconnectReason, Link,
    Notification, Radio, ServiceRef,
};
use pageflip::session::constants::{
    DEVICE_NAME_CHARACTERISTIC, GENERIC_ACCESS_SERVICE, HID_INFORMATION_CHARACTERISTIC,
    HID_REPORT_CHARACTERISTIC, HID_REPORT_MAP_CHARACTERISTIC, HID_SERVICE,
    REPORT_REFERENCE_DESCRIPTOR,
};

pub const REPORT_DESCRIPTOR_HEX: &str = "05010902a101c0";

pub const GA_SERVICE_HANDLE: u16 = 1;
pub const DEVICE_NAME_HANDLE: u16 = 2;
pub const HID_SERVICE_HANDLE: u16 = 16;
pub const HID_INFO_HANDLE: u16 = 38;
pub const REPORT_MAP_HANDLE: u16 = 40;
pub const REPORT_CHAR_HANDLE: u16 = 42;
pub const REPORT_REF_HANDLE: u16 = 43;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    SecureSession { reuse_bond: bool },
    DiscoverServices,
    DiscoverCharacteristics(u16),
    DiscoverDescriptors(u16),
    ReadValue(u16),
    Subscribe(u16),
    Disconnect,
    PurgeBonding,
    CloseRadio,
}

pub type CallLog = Rc<RefCell<Vec<Call>>>;

pub fn position(calls: &[Call], wanted: &Call) -> Option<usize> {
    calls.iter().position(|call| call == wanted)
}

pub struct MockLink {
    pub calls: CallLog,
    pub services: Vec<ServiceRef>,
    pub characteristics: HashMap<u16, Vec<CharacteristicRef>>,
    pub descriptors: HashMap<u16, Vec<DescriptorRef>>,
    pub values: HashMap<u16, Vec<u8>>,
    pub secure_results: VecDeque<Result<(), SecureSessionError>>,
    pub failing_subscribes: Vec<u16>,
    pub notifications: Option<mpsc::Receiver<Notification>>,
    pub disconnect: Option<oneshot::Receiver<DisconnectReason>>,
}

impl Link for MockLink {
    async fn begin_secure_session(&mut self, reuse_bond: bool) -> Result<(), SecureSessionError> {
        self.calls.borrow_mut().push(Call::SecureSession { reuse_bond });
        self.secure_results.pop_front().unwrap_or(Ok(()))
    }

    async fn discover_services(&mut self) -> Result<Vec<ServiceRef>, LinkError> {
        self.calls.borrow_mut().push(Call::DiscoverServices);
        Ok(self.services.clone())
    }

    async fn discover_characteristics(
        &mut self,
        service: &ServiceRef,
    ) -> Result<Vec<CharacteristicRef>, LinkError> {
        self.calls.borrow_mut().push(Call::DiscoverCharacteristics(service.handle));
        Ok(self.characteristics.get(&service.handle).cloned().unwrap_or_default())
    }

    async fn discover_descriptors(
        &mut self,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<DescriptorRef>, LinkError> {
        self.calls.borrow_mut().push(Call::DiscoverDescriptors(characteristic.handle));
        Ok(self.descriptors.get(&characteristic.handle).cloned().unwrap_or_default())
    }

    async fn read_value(&mut self, handle: u16) -> Result<Vec<u8>, LinkError> {
        self.calls.borrow_mut().push(Call::ReadValue(handle));
        self.values.get(&handle).cloned().ok_or(LinkError::MissingAttribute)
    }

    async fn subscribe(&mut self, characteristic: &CharacteristicRef) -> Result<(), LinkError> {
        self.calls.borrow_mut().push(Call::Subscribe(characteristic.handle));
        if self.failing_subscribes.contains(&characteristic.handle) {
            return Err(LinkError::Transport("subscription refused".to_string()));
        }
        Ok(())
    }

    fn take_notifications(&mut self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications.take()
    }

    fn take_disconnect(&mut self) -> Option<oneshot::Receiver<DisconnectReason>> {
        self.disconnect.take()
    }

    async fn disconnect(&mut self) {
        self.calls.borrow_mut().push(Call::Disconnect);
    }
}

pub struct MockRadio {
    pub calls: CallLog,
    pub links: VecDeque<MockLink>,
    pub bonded: bool,
}

impl Radio for MockRadio {
    type Link = MockLink;

    async fn connect(
        &mut self,
        _address: &Address,
        _timeout: Duration,
    ) -> Result<ConnectOutcome<MockLink>, LinkError> {
        self.calls.borrow_mut().push(Call::Connect);
        match self.links.pop_front() {
            Some(link) => Ok(ConnectOutcome::Connected(link)),
            None => Ok(ConnectOutcome::TimedOut),
        }
    }

    fn has_prior_bonding(&self, _address: &Address) -> bool {
        self.bonded
    }

    fn purge_bonding(&mut self, _address: &Address) {
        self.calls.borrow_mut().push(Call::PurgeBonding);
        self.bonded = false;
    }

    async fn close(&mut self) {
        self.calls.borrow_mut().push(Call::CloseRadio);
    }
}

/// The channel ends the test keeps to drive an active session.
pub struct RemoteHandle {
    pub notify_tx: mpsc::Sender<Notification>,
    pub disconnect_tx: oneshot::Sender<DisconnectReason>,
}

/// A typical page-turner remote: generic access service with a device name,
/// HID service with information, report map and one input report
/// characteristic (handle 42, report id 1).
pub fn remote_link(calls: &CallLog) -> (MockLink, RemoteHandle) {
    let (notify_tx, notify_rx) = mpsc::channel(16);
    let (disconnect_tx, disconnect_rx) = oneshot::channel();

    let services = vec![
        ServiceRef { uuid: GENERIC_ACCESS_SERVICE, handle: GA_SERVICE_HANDLE },
        ServiceRef { uuid: HID_SERVICE, handle: HID_SERVICE_HANDLE },
    ];

    let mut characteristics = HashMap::new();
    characteristics.insert(
        GA_SERVICE_HANDLE,
        vec![CharacteristicRef {
            uuid: DEVICE_NAME_CHARACTERISTIC,
            handle: DEVICE_NAME_HANDLE,
            properties: 0x02,
        }],
    );
    characteristics.insert(
        HID_SERVICE_HANDLE,
        vec![
            CharacteristicRef {
                uuid: HID_INFORMATION_CHARACTERISTIC,
                handle: HID_INFO_HANDLE,
                properties: 0x02,
            },
            CharacteristicRef {
                uuid: HID_REPORT_MAP_CHARACTERISTIC,
                handle: REPORT_MAP_HANDLE,
                properties: 0x02,
            },
            CharacteristicRef {
                uuid: HID_REPORT_CHARACTERISTIC,
                handle: REPORT_CHAR_HANDLE,
                properties: 0x12,
            },
        ],
    );

    let mut descriptors = HashMap::new();
    descriptors.insert(
        REPORT_CHAR_HANDLE,
        vec![DescriptorRef { uuid: REPORT_REFERENCE_DESCRIPTOR, handle: REPORT_REF_HANDLE }],
    );

    let mut values = HashMap::new();
    values.insert(DEVICE_NAME_HANDLE, b"BLE-M3".to_vec());
    values.insert(HID_INFO_HANDLE, vec![0x11, 0x01, 0x00, 0x02]);
    values.insert(REPORT_MAP_HANDLE, parse_hex(REPORT_DESCRIPTOR_HEX).unwrap());
    values.insert(REPORT_REF_HANDLE, vec![0x01, 0x01]);

    let link = MockLink {
        calls: Rc::clone(calls),
        services,
        characteristics,
        descriptors,
        values,
        secure_results: VecDeque::new(),
        failing_subscribes: vec![],
        notifications: Some(notify_rx),
        disconnect: Some(disconnect_rx),
    };

    (link, RemoteHandle { notify_tx, disconnect_tx })
}
