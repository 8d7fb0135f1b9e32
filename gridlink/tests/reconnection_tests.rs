//! Supervised reconnection after a connected transport is lost

mod common;

use common::*;
use gridlink::*;
use std::time::Duration;

const GRID: &str = "grid-1";

fn with_policy(max_attempts: u32, retry_delay: Duration, delays: Vec<Duration>) -> GridConfig {
    GridConfig {
        reconnect: ReconnectPolicy {
            max_attempts,
            retry_delay,
            delays,
        },
        ..GridConfig::default()
    }
}

fn reconnection_events(events: &[ConnectionEvent]) -> Vec<ConnectionEvent> {
    events
        .iter()
        .filter(|e| e.is_reconnection_event())
        .cloned()
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_lost_transport_is_restored_on_same_session() {
    let connector = ScriptedConnector::new(&[
        (ConnectionTier::P2p, Script::Succeed(Duration::ZERO)),
        (ConnectionTier::P2p, Script::Fail(Duration::from_secs(1))),
        (ConnectionTier::P2p, Script::Succeed(Duration::ZERO)),
    ]);
    let billing = FakeBilling::new(relay_config(RelayMode::P2pOnly, 100.0, 1.0));
    let grid_link = grid_link(connector.clone(), billing, GridConfig::default());
    let manager = grid_link.manager("bob");

    let session = manager.connect(GRID).await.unwrap();
    let mut events = manager.subscribe();

    connector.transport(0).lose();
    tokio::time::sleep(Duration::from_secs(6)).await;

    let seen = drain(&mut events);
    let reconnection = reconnection_events(&seen);
    assert_eq!(reconnection.len(), 3);
    assert!(matches!(
        reconnection[0],
        ConnectionEvent::Reconnecting { attempt: 1, max_attempts: 5, .. }
    ));
    assert!(matches!(
        reconnection[1],
        ConnectionEvent::Reconnecting { attempt: 2, .. }
    ));
    match &reconnection[2] {
        ConnectionEvent::Reconnected {
            session_id,
            attempt,
            tier,
        } => {
            assert_eq!(session_id, &session.session_id);
            assert_eq!(*attempt, 2);
            assert_eq!(*tier, ConnectionTier::P2p);
        }
        other => panic!("expected reconnected, got {:?}", other),
    }

    let states: Vec<ConnectionState> = seen
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Reconnecting,
            ConnectionState::AttemptingP2p,
            ConnectionState::Reconnecting,
            ConnectionState::AttemptingP2p,
            ConnectionState::ConnectedP2p,
        ]
    );

    let restored = manager.session().unwrap();
    assert_eq!(restored.session_id, session.session_id);
    assert_eq!(restored.state, ConnectionState::ConnectedP2p);
    assert_eq!(restored.reconnect_attempt, 0);
    assert!(restored.last_error.is_none());

    assert_eq!(connector.transport(0).close_count(), 1);
    assert_eq!(connector.transport_count(), 2);
    assert_eq!(grid_link.list_sessions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnection_fails_and_removes_session() {
    let connector = ScriptedConnector::new(&[
        (ConnectionTier::P2p, Script::Succeed(Duration::ZERO)),
        (ConnectionTier::P2p, Script::Fail(Duration::ZERO)),
    ]);
    let billing = FakeBilling::new(relay_config(RelayMode::P2pOnly, 100.0, 1.0));
    let config = with_policy(
        3,
        Duration::from_secs(5),
        vec![Duration::from_secs(1), Duration::from_secs(3)],
    );
    let grid_link = grid_link(connector.clone(), billing, config);
    let manager = grid_link.manager("bob");

    manager.connect(GRID).await.unwrap();
    let mut events = manager.subscribe();

    connector.transport(0).lose();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let reconnection = reconnection_events(&drain(&mut events));
    let delays: Vec<Duration> = reconnection
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::Reconnecting { retry_in, .. } => Some(*retry_in),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(3),
            Duration::from_secs(5),
        ]
    );
    assert_eq!(reconnection.len(), 4);
    assert!(matches!(
        reconnection[3],
        ConnectionEvent::ReconnectionFailed { attempts: 3, .. }
    ));

    assert_eq!(manager.get_state(), ConnectionState::Failed);
    assert!(manager.session().is_none());
    assert!(grid_link.list_sessions().is_empty());
    assert_eq!(connector.calls().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_retry() {
    let connector = ScriptedConnector::new(&[(ConnectionTier::P2p, Script::Succeed(Duration::ZERO))]);
    let billing = FakeBilling::new(relay_config(RelayMode::P2pFirst, 100.0, 1.0));
    let config = with_policy(5, Duration::from_secs(10), Vec::new());
    let grid_link = grid_link(connector.clone(), billing, config);
    let manager = grid_link.manager("bob");

    manager.connect(GRID).await.unwrap();
    let mut events = manager.subscribe();

    connector.transport(0).lose();
    wait_until(|| manager.get_state() == ConnectionState::Reconnecting).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    manager.disconnect().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(connector.calls().len(), 1);
    assert_eq!(manager.get_state(), ConnectionState::Idle);
    assert!(grid_link.list_sessions().is_empty());

    let reconnection = reconnection_events(&drain(&mut events));
    assert_eq!(reconnection.len(), 1);
    assert!(matches!(
        reconnection[0],
        ConnectionEvent::Reconnecting { attempt: 1, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_peer_disconnect_starts_supervision() {
    let connector = ScriptedConnector::new(&[(ConnectionTier::P2p, Script::Succeed(Duration::ZERO))]);
    let billing = FakeBilling::new(relay_config(RelayMode::P2pFirst, 100.0, 1.0));
    let grid_link = grid_link(connector.clone(), billing, GridConfig::default());
    let manager = grid_link.manager("bob");

    assert!(!manager.handle_peer_disconnect());

    manager.connect(GRID).await.unwrap();
    let mut events = manager.subscribe_filtered(EventFilter::reconnection_only());

    assert!(manager.handle_peer_disconnect());
    assert!(!manager.handle_peer_disconnect());
    assert_eq!(manager.get_state(), ConnectionState::Reconnecting);
    assert!(manager.get_stats().is_none());

    let session = manager.session().unwrap();
    assert_eq!(session.state, ConnectionState::Reconnecting);
    assert_eq!(session.last_error.as_deref(), Some("peer disconnected"));

    match events.next().await {
        Some(ConnectionEvent::Reconnecting { attempt, .. }) => assert_eq!(attempt, 1),
        other => panic!("expected reconnecting, got {:?}", other),
    }
    match events.next().await {
        Some(ConnectionEvent::Reconnected { attempt, .. }) => assert_eq!(attempt, 1),
        other => panic!("expected reconnected, got {:?}", other),
    }
    assert_eq!(connector.transport(0).close_count(), 1);
    assert_eq!(manager.get_state(), ConnectionState::ConnectedP2p);
}

#[tokio::test(start_paused = true)]
async fn test_quota_exhausted_during_reconnect_stops_retrying() {
    let connector = ScriptedConnector::new(&[(ConnectionTier::P2p, Script::Succeed(Duration::ZERO))]);
    let billing = FakeBilling::new(relay_config(RelayMode::P2pFirst, 100.0, 50.0));
    let grid_link = grid_link(connector.clone(), billing.clone(), GridConfig::default());
    let manager = grid_link.manager("bob");

    manager.connect(GRID).await.unwrap();
    let mut events = manager.subscribe();

    billing.set_used_gb(100.0);
    connector.transport(0).lose();
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(manager.get_state(), ConnectionState::QuotaExceeded);
    assert_eq!(connector.calls().len(), 1);

    let session = manager.session().unwrap();
    assert_eq!(session.state, ConnectionState::QuotaExceeded);
    assert!(session.last_error.unwrap().contains("quota"));

    let reconnection = reconnection_events(&drain(&mut events));
    assert_eq!(reconnection.len(), 1);

    manager.disconnect().await;
    assert!(grid_link.list_sessions().is_empty());
}
