#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use blueq::fake::FakeAdapter;
use blueq::{CharacteristicId, CharacteristicProperties, ConnectionObserver, ConnectionState,
            Peripheral, PeripheralId, ServiceId, Session, SessionConfig};

pub const HEART_RATE: ServiceId = ServiceId::from_u16(0x180D);
pub const MEASUREMENT: CharacteristicId = CharacteristicId::from_u16(0x2A37, HEART_RATE);
pub const BODY_LOCATION: CharacteristicId = CharacteristicId::from_u16(0x2A38, HEART_RATE);
pub const CONTROL_POINT: CharacteristicId = CharacteristicId::from_u16(0x2A39, HEART_RATE);

pub const BATTERY: ServiceId = ServiceId::from_u16(0x180F);
pub const BATTERY_LEVEL: CharacteristicId = CharacteristicId::from_u16(0x2A19, BATTERY);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn heart_rate_services() -> Vec<(ServiceId, Vec<(CharacteristicId, CharacteristicProperties)>)> {
    vec![(HEART_RATE,
          vec![(MEASUREMENT, CharacteristicProperties::NOTIFY),
               (BODY_LOCATION, CharacteristicProperties::READ),
               (CONTROL_POINT, CharacteristicProperties::WRITE)]),
         (BATTERY,
          vec![(BATTERY_LEVEL, CharacteristicProperties::READ | CharacteristicProperties::NOTIFY)])]
}

/// A powered on session with no peripheral connected
pub async fn powered_session(config: SessionConfig) -> (Session, FakeAdapter) {
    init_logging();
    let (session, adapter) = config.start_fake().await.unwrap();
    adapter.power_on();
    session.flush().await.unwrap();
    (session, adapter)
}

/// A session connected to a fake heart rate monitor
pub async fn connected_session(config: SessionConfig) -> (Session, FakeAdapter, PeripheralId) {
    let (session, mut adapter) = powered_session(config).await;
    let peripheral = adapter.declare_peripheral();

    let connect = session.connect(peripheral);
    adapter.accept_connection(peripheral, &heart_rate_services()).await;
    let resolved = connect.await.unwrap();
    assert_eq!(resolved.id(), peripheral);
    assert_eq!(session.state(), ConnectionState::Connected);

    (session, adapter, peripheral)
}

/// Collects values passed to a listen callback
pub fn collector() -> (Arc<Mutex<Vec<Vec<u8>>>>, impl FnMut(Vec<u8>) + Send + 'static) {
    let values = Arc::new(Mutex::new(vec![]));
    let sink = values.clone();
    (values, move |value| sink.lock().unwrap().push(value))
}

#[derive(Default)]
pub struct RecordingObserver {
    pub log: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_availability_changed(&self, available: bool) {
        self.log.lock().unwrap().push(format!("available={}", available));
    }

    fn on_connected(&self, peripheral: &Peripheral) {
        self.log.lock().unwrap().push(format!("connected {}", peripheral.id()));
    }

    fn on_disconnected(&self) {
        self.log.lock().unwrap().push("disconnected".to_string());
    }

    fn on_state_changed(&self, state: ConnectionState) {
        self.log.lock().unwrap().push(format!("state={}", state));
    }
}
