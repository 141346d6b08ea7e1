//! End-to-end session scenarios against a scripted link stack.

mod support;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pageflip::actions::ActionMap;
use pageflip::cache::{AttributeCache, CacheEntry, CachedCharacteristic, ReportReference};
use pageflip::config::Config;
use pageflip::error::SecureSessionError;
use pageflip::link::Address;
use pageflip::session::constants::{
    HID_INFORMATION_CHARACTERISTIC, HID_REPORT_CHARACTERISTIC, HID_REPORT_MAP_CHARACTERISTIC,
};
use pageflip::session::{ConnectionSession, CycleOutcome};

use support::{
    position, remote_link, Call, CallLog, MockRadio, HID_INFO_HANDLE, HID_SERVICE_HANDLE,
    REPORT_CHAR_HANDLE, REPORT_DESCRIPTOR_HEX, REPORT_MAP_HANDLE,
};

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

fn test_config() -> Config {
    let mut config = Config::default();
    config.uhid.enabled = false;
    config
}

fn new_log() -> CallLog {
    Rc::new(RefCell::new(vec![]))
}

struct World {
    config: Config,
    actions: ActionMap,
    cache: AttributeCache,
    _cache_dir: TempDir,
}

impl World {
    fn new() -> Self {
        let config = test_config();
        let actions = ActionMap::from_config(&config.buttons);
        let cache_dir = TempDir::new().unwrap();
        let cache = AttributeCache::new(cache_dir.path().to_path_buf());
        World { config, actions, cache, _cache_dir: cache_dir }
    }

    fn session(&self) -> ConnectionSession<'_> {
        ConnectionSession::new(
            Address::parse(ADDRESS).unwrap(),
            &self.config,
            self.cache.clone(),
            &self.actions,
            CancellationToken::new(),
        )
    }
}

fn full_cache_entry() -> CacheEntry {
    let mut report_refs = indexmap::IndexMap::new();
    report_refs.insert(REPORT_CHAR_HANDLE.to_string(), ReportReference { id: 1, kind: 1 });

    CacheEntry {
        report_descriptor: REPORT_DESCRIPTOR_HEX.to_string(),
        device_name: Some("BLE-M3".to_string()),
        characteristics: Some(vec![
            CachedCharacteristic {
                uuid: HID_INFORMATION_CHARACTERISTIC.to_string(),
                handle: HID_INFO_HANDLE,
                properties: 0x02,
            },
            CachedCharacteristic {
                uuid: HID_REPORT_MAP_CHARACTERISTIC.to_string(),
                handle: REPORT_MAP_HANDLE,
                properties: 0x02,
            },
            CachedCharacteristic {
                uuid: HID_REPORT_CHARACTERISTIC.to_string(),
                handle: REPORT_CHAR_HANDLE,
                properties: 0x12,
            },
        ]),
        report_refs: Some(report_refs),
    }
}

// Scenario: first connection with an empty cache. Full discovery runs in
// order, the session goes active, and afterwards the cache holds the learned
// report reference for handle 42.
#[tokio::test]
async fn first_connection_discovers_and_populates_cache() {
    let world = World::new();
    let calls = new_log();
    let (link, remote) = remote_link(&calls);
    let mut radio = MockRadio { calls: Rc::clone(&calls), links: VecDeque::from([link]), bonded: false };

    let mut session = world.session();
    let established = session.establish(&mut radio).await.ok().expect("establishment failed");

    {
        let calls = calls.borrow();
        let discover = position(&calls, &Call::DiscoverServices).expect("no service discovery");
        let characteristics = position(&calls, &Call::DiscoverCharacteristics(HID_SERVICE_HANDLE))
            .expect("no characteristic discovery");
        let descriptors = position(&calls, &Call::DiscoverDescriptors(REPORT_CHAR_HANDLE))
            .expect("no descriptor discovery");
        let subscribe = position(&calls, &Call::Subscribe(REPORT_CHAR_HANDLE)).expect("no subscription");

        // Discovery strictly precedes subscription.
        assert!(discover < characteristics);
        assert!(characteristics < descriptors);
        assert!(descriptors < subscribe);
    }

    // End the active phase through the disconnect signal.
    remote.disconnect_tx.send(0x13).unwrap();
    let outcome = session.serve(established).await;
    assert!(matches!(outcome, CycleOutcome::Disconnected { reason: Some(0x13) }));

    let entry = world.cache.load(session.address()).await.expect("no cache entry written");
    assert_eq!(entry.report_descriptor, REPORT_DESCRIPTOR_HEX);
    assert_eq!(entry.device_name.as_deref(), Some("BLE-M3"));
    assert!(entry.characteristics.is_some());

    let refs = entry.report_refs.expect("no report refs cached");
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[&REPORT_CHAR_HANDLE.to_string()], ReportReference { id: 1, kind: 1 });
}

// Scenario: reconnecting with a complete cache entry. Only the
// service-presence confirmation goes over the wire; characteristic and
// descriptor round-trips are skipped entirely.
#[tokio::test]
async fn cached_reconnect_skips_characteristic_discovery() {
    let world = World::new();
    let address = Address::parse(ADDRESS).unwrap();
    world.cache.save(&address, &full_cache_entry()).await.unwrap();

    let calls = new_log();
    let (link, _remote) = remote_link(&calls);
    let mut radio = MockRadio { calls: Rc::clone(&calls), links: VecDeque::from([link]), bonded: true };

    let mut session = world.session();
    let _established = session.establish(&mut radio).await.ok().expect("establishment failed");

    let calls = calls.borrow();
    assert!(position(&calls, &Call::DiscoverServices).is_some());
    assert!(position(&calls, &Call::Subscribe(REPORT_CHAR_HANDLE)).is_some());

    assert!(
        !calls.iter().any(|call| matches!(
            call,
            Call::DiscoverCharacteristics(_) | Call::DiscoverDescriptors(_) | Call::ReadValue(_)
        )),
        "cache-assisted discovery should not issue attribute round-trips: {:?}",
        *calls
    );
}

// A session that fails the secure-session step never reaches discovery.
#[tokio::test]
async fn failed_pairing_never_reaches_discovery() {
    let world = World::new();
    let calls = new_log();
    let (mut link, _remote) = remote_link(&calls);
    link.secure_results = VecDeque::from([Err(SecureSessionError::PairingFailed {
        reason: "remote sent pairing-failed".to_string(),
    })]);
    let mut radio = MockRadio { calls: Rc::clone(&calls), links: VecDeque::from([link]), bonded: false };

    let mut session = world.session();
    let outcome = session.establish(&mut radio).await.err().expect("establishment should fail");
    assert!(matches!(outcome, CycleOutcome::PairingFailed));

    let calls = calls.borrow();
    assert!(position(&calls, &Call::DiscoverServices).is_none());
    // the half-open link is released
    assert!(position(&calls, &Call::Disconnect).is_some());
}

// A rejected bond is purged and followed by fresh pairing on the same cycle.
#[tokio::test]
async fn rejected_bond_is_purged_before_fresh_pairing() {
    let world = World::new();
    let calls = new_log();
    let (mut link, _remote) = remote_link(&calls);
    link.secure_results = VecDeque::from([Err(SecureSessionError::BondRejected), Ok(())]);
    let mut radio = MockRadio { calls: Rc::clone(&calls), links: VecDeque::from([link]), bonded: true };

    let mut session = world.session();
    assert!(session.establish(&mut radio).await.is_ok());
    assert!(!radio.bonded, "stale bond should be purged");

    let calls = calls.borrow();
    let silent = position(&calls, &Call::SecureSession { reuse_bond: true }).expect("no silent attempt");
    let purge = position(&calls, &Call::PurgeBonding).expect("bond not purged");
    let fresh = position(&calls, &Call::SecureSession { reuse_bond: false }).expect("no fresh pairing");
    assert!(silent < purge);
    assert!(purge < fresh);
}

// Controller corruption surfaces as its own outcome so the supervisor can
// recreate the radio instead of retrying against it.
#[tokio::test]
async fn controller_corruption_is_its_own_outcome() {
    let world = World::new();
    let calls = new_log();
    let (mut link, _remote) = remote_link(&calls);
    link.secure_results = VecDeque::from([Err(SecureSessionError::ControllerCorrupted)]);
    let mut radio = MockRadio { calls: Rc::clone(&calls), links: VecDeque::from([link]), bonded: true };

    let mut session = world.session();
    let outcome = session.establish(&mut radio).await.err().expect("establishment should fail");
    assert!(matches!(outcome, CycleOutcome::ControllerCorrupted));
}

// An absent remote is an outcome, not an error.
#[tokio::test]
async fn absent_remote_times_out_quietly() {
    let world = World::new();
    let calls = new_log();
    let mut radio = MockRadio { calls: Rc::clone(&calls), links: VecDeque::new(), bonded: false };

    let mut session = world.session();
    let outcome = session.establish(&mut radio).await.err().expect("establishment should fail");
    assert!(matches!(outcome, CycleOutcome::ConnectTimeout));
}

// A refused subscription is logged and skipped; the session still comes up.
#[tokio::test]
async fn subscription_failure_does_not_abort_establishment() {
    let world = World::new();
    let calls = new_log();
    let (mut link, _remote) = remote_link(&calls);
    link.failing_subscribes = vec![REPORT_CHAR_HANDLE];
    let mut radio = MockRadio { calls: Rc::clone(&calls), links: VecDeque::from([link]), bonded: false };

    let mut session = world.session();
    assert!(session.establish(&mut radio).await.is_ok());
    assert!(position(&calls.borrow(), &Call::Subscribe(REPORT_CHAR_HANDLE)).is_some());
}

// Cancelling an active session tears it down with a Stopped outcome.
#[tokio::test]
async fn cancellation_stops_an_active_session() {
    let world = World::new();
    let calls = new_log();
    let (link, remote) = remote_link(&calls);
    let mut radio = MockRadio { calls: Rc::clone(&calls), links: VecDeque::from([link]), bonded: false };

    let cancel = CancellationToken::new();
    let mut session = ConnectionSession::new(
        Address::parse(ADDRESS).unwrap(),
        &world.config,
        world.cache.clone(),
        &world.actions,
        cancel.clone(),
    );

    let established = session.establish(&mut radio).await.ok().expect("establishment failed");
    cancel.cancel();
    let outcome = session.serve(established).await;
    assert!(matches!(outcome, CycleOutcome::Stopped));
    assert!(position(&calls.borrow(), &Call::Disconnect).is_some());

    drop(remote);
}
