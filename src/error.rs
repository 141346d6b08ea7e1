use std::io;
use std::str::Utf8Error;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("No remote address configured; add at least one under \"devices\"")]
    NoDevicesConfigured,

    #[error("Invalid remote address {address:?}: {reason}")]
    BadAddress { address: String, reason: &'static str },

    #[error("Another instance already owns {path}: {source}")]
    AlreadyRunning { path: String, source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to read/write cache file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to encode cache entry: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link-layer failure: {0}")]
    Transport(String),

    #[error("The link dropped in the middle of an operation")]
    Disconnected,

    #[error("A required attribute is not available on the peer")]
    MissingAttribute,
}

/// Failure of the secure-session step. `ControllerCorrupted` is deliberately
/// its own variant: it means the underlying radio object must be discarded
/// and recreated; retrying against it fails deterministically.
#[derive(Error, Debug)]
pub enum SecureSessionError {
    #[error("Peer rejected the stored bond (link dropped during re-establishment)")]
    BondRejected,

    #[error("Pairing failed: {reason}")]
    PairingFailed { reason: String },

    #[error("Controller state corrupted (address type unset), radio must be recreated")]
    ControllerCorrupted,

    #[error("Secure session failed: {source}")]
    Link { #[from] source: LinkError },
}

#[derive(Error, Debug)]
pub enum UhidError {
    #[error("Failed to open uhid node {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("Failed to write uhid frame: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Short write on uhid frame: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Payload is {len} bytes, larger than the {max}-byte frame limit")]
    OversizedPayload { len: usize, max: usize },
}

impl UhidError {
    pub fn is_fatal_for_session(&self) -> bool {
        match self {
            UhidError::Open { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
