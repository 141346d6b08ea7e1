pub mod btle;

use std::fmt;
use std::time::Duration;
use futures::channel::mpsc;
use futures::channel::oneshot;
use uuid::Uuid;

use crate::error::{LinkError, SecureSessionError};

/// Normalized link-layer address of a remote. Always rendered as
/// colon-delimited uppercase hex octets ("AA:BB:CC:DD:EE:FF"); the cache key
/// form replaces colons with underscores, which is reversible because parsing
/// only ever accepts hex octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 6]);

impl Address {
    pub fn parse(text: &str) -> Result<Address, &'static str> {
        Self::parse_delimited(text, ':')
    }

    pub fn from_cache_key(key: &str) -> Result<Address, &'static str> {
        Self::parse_delimited(key, '_')
    }

    fn parse_delimited(text: &str, delimiter: char) -> Result<Address, &'static str> {
        let mut octets = [0u8; 6];
        let mut count = 0;

        for part in text.split(delimiter) {
            if count == 6 {
                return Err("too many octets");
            }
            if part.len() != 2 {
                return Err("octet is not two hex digits");
            }
            octets[count] = u8::from_str_radix(part, 16).map_err(|_| "octet is not hex")?;
            count += 1;
        }

        if count != 6 {
            return Err("too few octets");
        }

        Ok(Address(octets))
    }

    /// Filesystem-safe form used as the attribute-cache key.
    pub fn cache_key(&self) -> String {
        let o = &self.0;
        format!("{:02X}_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}", o[0], o[1], o[2], o[3], o[4], o[5])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", o[0], o[1], o[2], o[3], o[4], o[5])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub uuid: Uuid,
    pub handle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub uuid: Uuid,
    pub handle: u16,
    pub properties: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRef {
    pub uuid: Uuid,
    pub handle: u16,
}

/// A value notification pushed by the peer for a subscribed characteristic.
#[derive(Debug, Clone)]
pub struct Notification {
    pub handle: u16,
    pub value: Vec<u8>,
}

/// Reason code reported by the link layer on disconnection.
pub type DisconnectReason = u8;

/// A connection attempt that runs out its deadline is not an error; the
/// remote may simply be switched off or out of range.
pub enum ConnectOutcome<L> {
    Connected(L),
    TimedOut,
}

/// Creates radio objects. The supervisor goes through this seam so it can
/// discard a radio whose controller state is corrupted and start over with a
/// fresh one.
pub trait RadioFactory {
    type Radio: Radio;

    async fn open_radio(&self) -> Result<Self::Radio, LinkError>;
}

/// The local controller: connection establishment plus the bonding key store.
pub trait Radio {
    type Link: Link;

    async fn connect(
        &mut self,
        address: &Address,
        timeout: Duration,
    ) -> Result<ConnectOutcome<Self::Link>, LinkError>;

    fn has_prior_bonding(&self, address: &Address) -> bool;

    fn purge_bonding(&mut self, address: &Address);

    /// Graceful shutdown. The caller bounds this with a deadline and drops
    /// the radio unconditionally afterwards.
    async fn close(&mut self);
}

/// One established link to a remote: secure-session setup and the GATT
/// primitives the session needs. Pairing cryptography lives entirely behind
/// `begin_secure_session`.
pub trait Link {
    /// With `reuse_bond` the implementation attempts silent re-establishment
    /// from stored bonding material; without it, fresh pairing.
    async fn begin_secure_session(&mut self, reuse_bond: bool) -> Result<(), SecureSessionError>;

    async fn discover_services(&mut self) -> Result<Vec<ServiceRef>, LinkError>;

    async fn discover_characteristics(
        &mut self,
        service: &ServiceRef,
    ) -> Result<Vec<CharacteristicRef>, LinkError>;

    async fn discover_descriptors(
        &mut self,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<DescriptorRef>, LinkError>;

    async fn read_value(&mut self, handle: u16) -> Result<Vec<u8>, LinkError>;

    async fn subscribe(&mut self, characteristic: &CharacteristicRef) -> Result<(), LinkError>;

    /// Stream of notifications for all subscribed characteristics. Yields the
    /// channel at most once.
    fn take_notifications(&mut self) -> Option<mpsc::Receiver<Notification>>;

    /// One-shot disconnect signal, delivered asynchronously by the link
    /// layer. Yields the channel at most once.
    fn take_disconnect(&mut self) -> Option<oneshot::Receiver<DisconnectReason>>;

    async fn disconnect(&mut self);
}
