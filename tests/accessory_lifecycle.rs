//! Accessory Lifecycle Integration Tests
//!
//! Registry notifications, stream session claims and detach handling.


use integration_harness::{Fixture, YLP};
use std::sync::Arc;
use std::time::Duration;
use ykacc_transport::simulator::{SimulatedAccessory, SimulatedProvider};
use ykacc_transport::{
    AccessoryEvent, AccessoryFilter, AccessoryRegistry, ConnectionId, PickerError,
    StreamSession, TransportError,
};

#[tokio::test]
async fn test_protocol_scenario() {
    let fixture = Fixture::single_key();
    let descriptor = fixture.registry.get(ConnectionId(1)).unwrap();

    let err = StreamSession::open(&fixture.registry, &descriptor, "com.yubico.other")
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NoSuchProtocol { .. }));

    let session = StreamSession::open(&fixture.registry, &descriptor, YLP)
        .await
        .unwrap();
    assert!(session.is_valid());
    assert_eq!(fixture.sim.open_count(), 1);
}

#[tokio::test]
async fn test_concurrent_open_one_busy() {
    let fixture = Fixture::single_key();
    let descriptor = fixture.registry.get(ConnectionId(1)).unwrap();

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let registry = fixture.registry.clone();
            let descriptor = descriptor.clone();
            tokio::spawn(async move { StreamSession::open(&registry, &descriptor, YLP).await })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let opened = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(TransportError::AccessoryBusy { .. })))
        .count();
    assert_eq!(opened, 1);
    assert_eq!(busy, 1);
}

#[tokio::test]
async fn test_distinct_accessories_open_independently() {
    let fixture = Fixture::new(vec![
        SimulatedAccessory::yubikey(1),
        SimulatedAccessory::yubikey(2),
    ]);
    let first = fixture.registry.get(ConnectionId(1)).unwrap();
    let second = fixture.registry.get(ConnectionId(2)).unwrap();

    let (a, b) = tokio::join!(
        StreamSession::open(&fixture.registry, &first, YLP),
        StreamSession::open(&fixture.registry, &second, YLP),
    );
    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(fixture.registry.open_claims(), 2);
}

#[tokio::test]
async fn test_close_twice_single_release() {
    let fixture = Fixture::single_key();
    let descriptor = fixture.registry.get(ConnectionId(1)).unwrap();
    let session = StreamSession::open(&fixture.registry, &descriptor, YLP)
        .await
        .unwrap();

    session.close().await;
    session.close().await;
    drop(session);

    assert_eq!(fixture.registry.open_claims(), 0);
    let reopened = StreamSession::open(&fixture.registry, &descriptor, YLP).await;
    assert!(reopened.is_ok());
}

#[tokio::test]
async fn test_attach_detach_events() {
    let fixture = Fixture::new(vec![]);
    let mut events = fixture.registry.subscribe();
    assert!(fixture.registry.list_connected_accessories().is_empty());

    fixture.sim.attach(SimulatedAccessory::yubikey(4));
    let attached = events.recv().await.unwrap();
    assert_eq!(attached.connection_id(), ConnectionId(4));
    assert_eq!(fixture.registry.list_connected_accessories().len(), 1);

    fixture.sim.detach(ConnectionId(4));
    assert_eq!(
        events.recv().await.unwrap(),
        AccessoryEvent::Detached(ConnectionId(4))
    );
    assert!(fixture.registry.list_connected_accessories().is_empty());
}

#[tokio::test]
async fn test_duplicate_detach_tolerated() {
    let fixture = Fixture::single_key();
    let mut events = fixture.registry.subscribe();

    fixture.sim.detach(ConnectionId(1));
    fixture.sim.emit_detach(ConnectionId(1));
    fixture.sim.emit_detach(ConnectionId(99));
    fixture.sim.attach(SimulatedAccessory::yubikey(2));

    // Only the first detach and the attach are rebroadcast
    assert_eq!(
        events.recv().await.unwrap(),
        AccessoryEvent::Detached(ConnectionId(1))
    );
    assert_eq!(
        events.recv().await.unwrap().connection_id(),
        ConnectionId(2)
    );
    assert!(!fixture.registry.is_attached(ConnectionId(1)));
}

#[tokio::test]
async fn test_unregister_stops_updates() {
    let sim = SimulatedProvider::new();
    let registry = AccessoryRegistry::new(Arc::new(sim.clone()));

    registry.register_for_notifications();
    registry.register_for_notifications();
    registry.unregister_for_notifications();
    registry.unregister_for_notifications();
    assert!(!registry.is_registered());

    sim.attach(SimulatedAccessory::yubikey(3));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(registry.list_connected_accessories().is_empty());

    // Re-registering picks the accessory up through enumeration
    registry.register_for_notifications();
    assert!(registry.is_attached(ConnectionId(3)));
}

#[tokio::test]
async fn test_picker_cancel_and_failure() {
    let fixture = Fixture::single_key();

    fixture.sim.script_picker(Err(PickerError::Cancelled));
    assert_eq!(
        fixture
            .registry
            .show_picker_with_filter(&AccessoryFilter::any())
            .await
            .unwrap_err(),
        TransportError::PickerCancelled
    );

    let err = fixture
        .registry
        .show_picker_with_filter(&AccessoryFilter::name_contains("NEO"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::PickerFailed(_)));

    let chosen = fixture
        .registry
        .show_picker_with_filter(&AccessoryFilter::name_contains("5ci"))
        .await
        .unwrap();
    assert_eq!(chosen.connection_id, ConnectionId(1));
}

#[tokio::test]
async fn test_detach_during_open_releases_claim() {
    let fixture = Fixture::single_key();
    let descriptor = fixture.registry.get(ConnectionId(1)).unwrap();
    let mut events = fixture.registry.subscribe();

    fixture.sim.detach(ConnectionId(1));
    events.recv().await.unwrap();

    let err = StreamSession::open(&fixture.registry, &descriptor, YLP)
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::AccessoryDetached(ConnectionId(1)));
    assert_eq!(fixture.registry.open_claims(), 0);
}
