//! Application Session Integration Tests
//!
//! Connection façade lifecycle on top of the simulated accessory stack.


use integration_harness::{Fixture, test_config, wait_for_state};
use std::sync::Arc;
use std::time::Duration;
use ykacc_client::{
    ConnectionError, ConnectionState, InvalidationReason, SessionEvent, SessionSwitchPolicy,
};
use ykacc_protocol::{Apdu, ApplicationKind, INS_SELECT};
use ykacc_transport::simulator::{Reply, SimulatedAccessory, default_responder};
use ykacc_transport::{ConnectionId, TransportError};

/// Stock applet behaviour plus a hanging instruction (0x01) and an echo (0x02)
fn scripted_key(id: u64) -> SimulatedAccessory {
    SimulatedAccessory::yubikey(id).with_responder(|command: &[u8]| match command[1] {
        INS_SELECT => default_responder(command),
        0x01 => Reply::hang(),
        0x02 => {
            let mut out = command.to_vec();
            out.extend_from_slice(&[0x90, 0x00]);
            Reply::response(out)
        }
        _ => default_responder(command),
    })
}

#[tokio::test]
async fn test_same_kind_reuses_connection() {
    let fixture = Fixture::single_key();
    let facade = fixture.facade(test_config());

    let first = facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();
    let second = facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fixture.sim.open_count(), 1);
    // Only one SELECT went over the wire
    assert_eq!(fixture.sim.take_received(ConnectionId(1)).len(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_connection() {
    let fixture = Fixture::single_key();
    let facade = fixture.facade(test_config());

    let pending: Vec<_> = (0..8)
        .map(|_| facade.request_application_session(ApplicationKind::Piv))
        .collect();
    let sessions: Vec<_> = futures::future::join_all(pending)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(fixture.sim.open_count(), 1);
}

#[tokio::test]
async fn test_session_send_round_trip() {
    let fixture = Fixture::new(vec![scripted_key(1)]);
    let facade = fixture.facade(test_config());

    let session = facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();
    let response = session
        .send(&Apdu::new(0x00, 0x02, 0x00, 0x00).with_data(vec![0x01, 0x02]))
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(response.data, vec![0x00, 0x02, 0x00, 0x00, 0x02, 0x01, 0x02]);
}

#[tokio::test]
async fn test_detach_during_transmit_tears_down() {
    let fixture = Fixture::new(vec![scripted_key(1)]);
    let facade = fixture.facade(test_config());
    let mut events = facade.subscribe_events();

    let session = facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.transmit(&[0x00, 0x01, 0x00, 0x00]).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    fixture.sim.detach(ConnectionId(1));

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("transmit failed promptly")
        .unwrap();
    assert_eq!(
        result,
        Err(ConnectionError::Transport(TransportError::TransportClosed))
    );

    wait_for_state(&facade, ConnectionState::Idle, Duration::from_secs(1)).await;
    assert!(!session.is_valid());
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::Invalidated {
            kind: ApplicationKind::Piv,
            ..
        }
    ));
    assert_eq!(fixture.registry.open_claims(), 0);
}

#[tokio::test]
async fn test_timeout_tears_down_and_reconnects() {
    let fixture = Fixture::new(vec![scripted_key(1)]);
    let mut config = test_config();
    config.smart_card.response_timeout_ms = 80;
    let facade = fixture.facade(config);
    let mut events = facade.subscribe_events();

    let session = facade
        .request_application_session(ApplicationKind::Oath)
        .await
        .unwrap();
    let err = session
        .transmit(&[0x00, 0x01, 0x00, 0x00])
        .await
        .unwrap_err();
    assert!(err.is_transport_failure());

    wait_for_state(&facade, ConnectionState::Idle, Duration::from_secs(1)).await;
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::Invalidated {
            kind: ApplicationKind::Oath,
            reason: InvalidationReason::TransportFailure(TransportError::Timeout(
                Duration::from_millis(80)
            )),
        }
    );

    // A fresh request opens a new stream on the same accessory
    let again = facade
        .request_application_session(ApplicationKind::Oath)
        .await
        .unwrap();
    assert!(again.is_valid());
    assert!(!Arc::ptr_eq(&session, &again));
    assert_eq!(fixture.sim.open_count(), 2);
}

#[tokio::test]
async fn test_replace_keeps_stream() {
    let fixture = Fixture::single_key();
    let facade = fixture.facade(test_config());

    let piv = facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();
    let management = facade
        .request_application_session(ApplicationKind::Management)
        .await
        .unwrap();

    assert!(!piv.is_valid());
    assert!(management.is_valid());
    assert_eq!(
        facade.state(),
        ConnectionState::SessionActive(ApplicationKind::Management)
    );
    assert_eq!(fixture.sim.open_count(), 1);
    assert_eq!(
        piv.transmit(&[0x00, 0x02, 0x00, 0x00]).await.unwrap_err(),
        ConnectionError::SessionInvalidated
    );
}

#[tokio::test]
async fn test_reject_policy() {
    let fixture = Fixture::single_key();
    let mut config = test_config();
    config.session.switch_policy = SessionSwitchPolicy::Reject;
    let facade = fixture.facade(config);

    facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();
    let err = facade
        .request_application_session(ApplicationKind::Otp)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::SessionKindConflict { .. }));
    assert_eq!(
        facade.state(),
        ConnectionState::SessionActive(ApplicationKind::Piv)
    );
}

#[tokio::test]
async fn test_release_then_request_again() {
    let fixture = Fixture::single_key();
    let facade = fixture.facade(test_config());

    facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();
    facade.release_session().await;
    facade.release_session().await;
    assert_eq!(facade.state(), ConnectionState::Idle);
    assert_eq!(fixture.registry.open_claims(), 0);

    facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();
    assert_eq!(fixture.sim.open_count(), 2);
}

#[tokio::test]
async fn test_raw_interface_shares_serialization() {
    let fixture = Fixture::new(vec![scripted_key(1)]);
    let facade = fixture.facade(test_config());
    assert!(facade.smart_card_interface().is_none());

    let session = facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();
    let interface = facade.smart_card_interface().unwrap();

    let (a, b) = tokio::join!(
        session.transmit(&[0x00, 0x02, 0x00, 0x0A]),
        interface.transmit(&[0x00, 0x02, 0x00, 0x0B]),
    );
    assert_eq!(a.unwrap(), vec![0x00, 0x02, 0x00, 0x0A, 0x90, 0x00]);
    assert_eq!(b.unwrap(), vec![0x00, 0x02, 0x00, 0x0B, 0x90, 0x00]);
}

#[tokio::test]
async fn test_accessory_selection_skips_non_matching() {
    let fixture = Fixture::new(vec![
        SimulatedAccessory::yubikey(1).with_protocols(["com.example.audio"]),
        SimulatedAccessory::yubikey(2),
    ]);
    let facade = fixture.facade(test_config());

    facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();
    assert_eq!(
        facade.current_accessory().map(|a| a.connection_id),
        Some(ConnectionId(2))
    );
}

#[tokio::test]
async fn test_raw_interface_failure_tears_down() {
    let fixture = Fixture::new(vec![scripted_key(1)]);
    let mut config = test_config();
    config.smart_card.response_timeout_ms = 50;
    let facade = fixture.facade(config);
    let mut events = facade.subscribe_events();

    let session = facade
        .request_application_session(ApplicationKind::Piv)
        .await
        .unwrap();
    let interface = facade.smart_card_interface().unwrap();
    assert_eq!(
        interface
            .transmit(&[0x00, 0x01, 0x00, 0x00])
            .await
            .unwrap_err(),
        TransportError::Timeout(Duration::from_millis(50))
    );

    wait_for_state(&facade, ConnectionState::Idle, Duration::from_secs(1)).await;
    assert!(!session.is_valid());
    assert!(facade.smart_card_interface().is_none());
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::Invalidated {
            kind: ApplicationKind::Piv,
            reason: InvalidationReason::TransportFailure(TransportError::Timeout(
                Duration::from_millis(50)
            )),
        }
    );
    assert_eq!(fixture.registry.open_claims(), 0);
}

#[tokio::test]
async fn test_abandoned_transmit_tears_down() {
    let fixture = Fixture::new(vec![scripted_key(1)]);
    let facade = fixture.facade(test_config());
    let mut events = facade.subscribe_events();

    let session = facade
        .request_application_session(ApplicationKind::Oath)
        .await
        .unwrap();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        session.transmit(&[0x00, 0x01, 0x00, 0x00]),
    )
    .await;
    assert!(abandoned.is_err());

    wait_for_state(&facade, ConnectionState::Idle, Duration::from_secs(1)).await;
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::Invalidated {
            kind: ApplicationKind::Oath,
            reason: InvalidationReason::TransportFailure(TransportError::Desynchronized),
        }
    );

    // The next request gets a fresh stream rather than the stale response
    let again = facade
        .request_application_session(ApplicationKind::Oath)
        .await
        .unwrap();
    let response = again.transmit(&[0x00, 0x02, 0x00, 0x07]).await.unwrap();
    assert_eq!(response, vec![0x00, 0x02, 0x00, 0x07, 0x90, 0x00]);
    assert_eq!(fixture.sim.open_count(), 2);
}
