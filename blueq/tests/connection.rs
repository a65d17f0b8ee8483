mod common;

use std::time::Duration;

use futures::StreamExt;

use blueq::fake::FakeCommand;
use blueq::{BackendEvent, CharacteristicProperties, ConnectionState, Error, Event, Filter,
            SessionConfig};

use common::*;

#[tokio::test]
async fn connect_resolves_once_discovery_finishes() {
    let (session, mut adapter) = powered_session(SessionConfig::new()).await;
    let p = adapter.declare_peripheral();
    adapter.advertise(p, Some("HRM"), &[HEART_RATE]);

    let connect = session.connect(p);
    adapter.accept_connection(p, &heart_rate_services()).await;
    let peripheral = connect.await.unwrap();

    assert_eq!(peripheral.id(), p);
    assert_eq!(peripheral.name(), Some("HRM"));
    assert_eq!(peripheral.services(), vec![HEART_RATE, BATTERY]);
    assert_eq!(peripheral.characteristics(HEART_RATE).len(), 3);
    let level = peripheral.characteristic(BATTERY_LEVEL).unwrap();
    assert!(level.properties.contains(CharacteristicProperties::NOTIFY));
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn read_after_a_failed_connect_reports_not_connected() {
    let (session, mut adapter) = powered_session(SessionConfig::new()).await;
    let p = adapter.declare_peripheral();

    let connect = session.connect(p);
    let read = session.read(MEASUREMENT);

    adapter.expect_command(FakeCommand::Connect(p)).await;
    adapter.emit(BackendEvent::PeripheralConnectionFailed { peripheral: p, error: None });

    assert!(matches!(connect.await, Err(Error::ConnectionFailed(None))));
    assert!(matches!(read.await, Err(Error::NotConnected)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.try_next_command(), None);
}

#[tokio::test]
async fn failed_discovery_tears_the_link_down() {
    let (session, mut adapter) = powered_session(SessionConfig::new()).await;
    let p = adapter.declare_peripheral();

    let connect = session.connect(p);
    adapter.expect_command(FakeCommand::Connect(p)).await;
    adapter.emit(BackendEvent::PeripheralConnected { peripheral: p });
    adapter.expect_command(FakeCommand::DiscoverServices(p)).await;
    adapter.emit(BackendEvent::ServicesDiscovered {
        peripheral: p,
        services: vec![],
        error: Some(blueq::GattError::InsufficientAuthentication),
    });

    assert!(matches!(connect.await, Err(Error::ConnectionFailed(Some(_)))));
    adapter.expect_command(FakeCommand::Disconnect(p)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_cancels_the_attempt() {
    init_logging();
    let mut config = SessionConfig::new();
    config.set_connect_timeout(Duration::from_secs(5));
    let (session, mut adapter) = config.start_fake().await.unwrap();
    adapter.power_on();
    let p = adapter.declare_peripheral();

    let connect = session.connect(p);
    adapter.expect_command(FakeCommand::Connect(p)).await;
    assert_eq!(session.state(), ConnectionState::Connecting);

    assert!(matches!(connect.await, Err(Error::ConnectionTimeout)));
    adapter.expect_command(FakeCommand::Disconnect(p)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);

    // The adapter reporting the connection anyway gets it dropped again
    adapter.emit(BackendEvent::PeripheralConnected { peripheral: p });
    adapter.expect_command(FakeCommand::Disconnect(p)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn link_loss_fails_every_bound_operation() {
    let (session, mut adapter, p) = connected_session(SessionConfig::new()).await;

    let in_flight = session.read(MEASUREMENT);
    let pending = session.read(BODY_LOCATION);
    let write = session.write(CONTROL_POINT, vec![1], blueq::WriteType::WithResponse);
    adapter.expect_command(FakeCommand::Read(p, MEASUREMENT)).await;

    adapter.emit(BackendEvent::PeripheralDisconnected { peripheral: p, error: None });

    assert!(matches!(in_flight.await, Err(Error::Disconnected)));
    assert!(matches!(pending.await, Err(Error::Disconnected)));
    assert!(matches!(write.await, Err(Error::Disconnected)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.try_next_command(), None);
}

#[tokio::test]
async fn operations_bound_to_a_lost_link_never_reach_the_next_one() {
    let (session, mut adapter, p) = connected_session(SessionConfig::new()).await;

    let read = session.read(MEASUREMENT);
    adapter.expect_command(FakeCommand::Read(p, MEASUREMENT)).await;
    let stale = session.read(BODY_LOCATION);

    adapter.emit(BackendEvent::PeripheralDisconnected { peripheral: p, error: None });
    let other = adapter.declare_peripheral();
    let reconnect = session.connect(other);
    adapter.accept_connection(other, &heart_rate_services()).await;
    reconnect.await.unwrap();

    assert!(matches!(read.await, Err(Error::Disconnected)));
    assert!(matches!(stale.await, Err(Error::Disconnected)));
}

#[tokio::test]
async fn disconnect_resolves_when_the_link_drops() {
    let (session, mut adapter, p) = connected_session(SessionConfig::new()).await;

    let disconnect = session.disconnect();
    adapter.expect_command(FakeCommand::Disconnect(p)).await;
    assert_eq!(session.state(), ConnectionState::Disconnecting);

    adapter.emit(BackendEvent::PeripheralDisconnected { peripheral: p, error: None });
    disconnect.await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_without_a_connection_fails() {
    let (session, _adapter) = powered_session(SessionConfig::new()).await;
    assert!(matches!(session.disconnect().await, Err(Error::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn disconnect_timeout_drops_the_link_locally() {
    let mut config = SessionConfig::new();
    config.set_operation_timeout(Duration::from_secs(2));
    let (session, mut adapter, p) = connected_session(config).await;

    let disconnect = session.disconnect();
    adapter.expect_command(FakeCommand::Disconnect(p)).await;

    assert!(matches!(disconnect.await, Err(Error::OperationTimeout)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connecting_to_the_connected_peripheral_is_a_no_op() {
    let (session, mut adapter, p) = connected_session(SessionConfig::new()).await;

    let peripheral = session.connect(p).await.unwrap();
    assert_eq!(peripheral.id(), p);
    assert_eq!(adapter.try_next_command(), None);

    let other = adapter.declare_peripheral();
    assert!(matches!(session.connect(other).await, Err(Error::Other(_))));
}

#[tokio::test]
async fn scan_streams_matching_peripherals_until_stopped() {
    let (session, mut adapter) = powered_session(SessionConfig::new()).await;
    let hrm = adapter.declare_peripheral();
    let other = adapter.declare_peripheral();

    let mut filter = Filter::new();
    filter.add_service(HEART_RATE);
    let mut scan = session.scan(filter.clone());
    adapter.expect_command(FakeCommand::StartScanning(filter)).await;
    assert_eq!(session.state(), ConnectionState::Scanning);

    adapter.advertise(other, Some("Scale"), &[BATTERY]);
    adapter.advertise(hrm, Some("HRM"), &[HEART_RATE]);

    let found = scan.next().await.unwrap().unwrap();
    assert_eq!(found.id, hrm);
    assert_eq!(found.name.as_deref(), Some("HRM"));

    session.stop_scan();
    adapter.expect_command(FakeCommand::StopScanning).await;
    assert!(scan.next().await.is_none());
    assert_eq!(session.state(), ConnectionState::Disconnected);

    // Everything seen while scanning is remembered, matching or not
    assert_eq!(session.peripherals().len(), 2);
    assert_eq!(session.peripheral(&other).unwrap().name.as_deref(), Some("Scale"));
}

#[tokio::test(start_paused = true)]
async fn scans_stop_by_themselves() {
    init_logging();
    let mut config = SessionConfig::new();
    config.set_scan_timeout(Some(Duration::from_secs(3)));
    let (session, mut adapter) = config.start_fake().await.unwrap();
    adapter.power_on();

    let mut scan = session.scan(Filter::new());
    let read = session.read(MEASUREMENT);
    adapter.expect_command(FakeCommand::StartScanning(Filter::new())).await;

    assert!(scan.next().await.is_none());
    adapter.expect_command(FakeCommand::StopScanning).await;
    assert!(matches!(read.await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn scanning_while_connected_fails() {
    let (session, _adapter, _p) = connected_session(SessionConfig::new()).await;

    let mut scan = session.scan(Filter::new());
    assert!(matches!(scan.next().await, Some(Err(Error::Other(_)))));
    assert!(scan.next().await.is_none());
}

#[tokio::test]
async fn scan_and_connect_connects_to_the_first_match() {
    let (session, mut adapter) = powered_session(SessionConfig::new()).await;
    let mut states = Box::pin(session.events().filter_map(|event| async move {
                                                   match event {
                                                       Event::StateChanged { state, .. } => {
                                                           Some(state)
                                                       }
                                                       _ => None,
                                                   }
                                               }));
    let hrm = adapter.declare_peripheral();
    let other = adapter.declare_peripheral();

    let mut filter = Filter::new();
    filter.add_service(HEART_RATE);
    let connect = session.scan_and_connect(filter.clone());
    adapter.expect_command(FakeCommand::StartScanning(filter)).await;

    adapter.advertise(other, None, &[BATTERY]);
    adapter.advertise(hrm, Some("HRM"), &[HEART_RATE]);
    adapter.expect_command(FakeCommand::StopScanning).await;
    adapter.accept_connection(hrm, &heart_rate_services()).await;

    let peripheral = connect.await.unwrap();
    assert_eq!(peripheral.id(), hrm);
    assert_eq!(peripheral.name(), Some("HRM"));

    let mut seen = vec![];
    for _ in 0..4 {
        seen.push(states.next().await.unwrap());
    }
    assert_eq!(seen,
               vec![ConnectionState::Scanning,
                    ConnectionState::Disconnected,
                    ConnectionState::Connecting,
                    ConnectionState::Connected]);
}

#[tokio::test]
async fn stopping_scan_and_connect_cancels_it() {
    let (session, mut adapter) = powered_session(SessionConfig::new()).await;

    let connect = session.scan_and_connect(Filter::new());
    adapter.expect_command(FakeCommand::StartScanning(Filter::new())).await;
    session.stop_scan();

    assert!(matches!(connect.await, Err(Error::Cancelled)));
    adapter.expect_command(FakeCommand::StopScanning).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn power_off_while_connected_surfaces_as_a_disconnect() {
    let (session, adapter, _p) = connected_session(SessionConfig::new()).await;
    let observer = std::sync::Arc::new(RecordingObserver::default());
    session.register_observer(&observer);

    let read = session.read(MEASUREMENT);
    adapter.power_off();

    assert!(matches!(read.await, Err(Error::Disconnected)));
    assert_eq!(session.state(), ConnectionState::PoweredOff);
    assert_eq!(observer.take(),
               vec!["state=disconnected", "disconnected", "available=false", "state=powered off"]);
}

#[tokio::test]
async fn dropping_a_scan_stream_stops_the_scan() {
    let mut config = SessionConfig::new();
    config.set_scan_timeout(None);
    let (session, mut adapter) = powered_session(config).await;
    let p = adapter.declare_peripheral();

    let scan = session.scan(Filter::new());
    adapter.expect_command(FakeCommand::StartScanning(Filter::new())).await;
    drop(scan);

    // Nothing queued behind the scan is held up by it
    let connect = session.connect(p);
    adapter.expect_command(FakeCommand::StopScanning).await;
    adapter.accept_connection(p, &heart_rate_services()).await;
    connect.await.unwrap();
}

#[tokio::test]
async fn dropping_a_queued_scan_never_starts_it() {
    let (session, mut adapter, p) = connected_session(SessionConfig::new()).await;

    let read = session.read(MEASUREMENT);
    let scan = session.scan(Filter::new());
    adapter.expect_command(FakeCommand::Read(p, MEASUREMENT)).await;
    drop(scan);

    adapter.read_response(p, MEASUREMENT, Ok(vec![1]));
    read.await.unwrap();
    session.flush().await.unwrap();
    assert_eq!(adapter.try_next_command(), None);
}

#[tokio::test]
async fn disconnect_queued_behind_a_link_loss_still_succeeds() {
    let (session, mut adapter, p) = connected_session(SessionConfig::new()).await;

    let read = session.read(MEASUREMENT);
    let disconnect = session.disconnect();
    adapter.expect_command(FakeCommand::Read(p, MEASUREMENT)).await;
    adapter.emit(BackendEvent::PeripheralDisconnected { peripheral: p, error: None });

    assert!(matches!(read.await, Err(Error::Disconnected)));
    disconnect.await.unwrap();
    assert_eq!(adapter.try_next_command(), None);
}
