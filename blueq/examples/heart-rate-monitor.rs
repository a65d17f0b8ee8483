use std::time::Duration;

use log::{info, warn};

use blueq::codec::Decode;
use blueq::fake::{FakeAdapter, FakeCommand};
use blueq::{BackendEvent, CharacteristicId, CharacteristicProperties, Error, Filter,
            PeripheralId, ServiceId, SessionConfig};

const HEART_RATE: ServiceId = ServiceId::from_u16(0x180D);
const MEASUREMENT: CharacteristicId = CharacteristicId::from_u16(0x2A37, HEART_RATE);
const BODY_LOCATION: CharacteristicId = CharacteristicId::from_u16(0x2A38, HEART_RATE);

#[derive(Debug)]
struct HeartRate {
    bpm: u16,
    // None if the sensor can't detect skin contact
    in_contact: Option<bool>,
    rr_intervals: Vec<f32>,
}

impl Decode for HeartRate {
    fn from_bytes(data: &[u8]) -> blueq::Result<Self> {
        let short = || Error::DecodeFailed(format!("truncated measurement {:?}", data));

        let flags = *data.first().ok_or_else(short)?;
        let (bpm, mut pos) = if flags & 0x1 == 0x1 {
            let bytes = data.get(1..3).ok_or_else(short)?;
            (u16::from_le_bytes([bytes[0], bytes[1]]), 3)
        } else {
            (*data.get(1).ok_or_else(short)? as u16, 2)
        };
        let in_contact = if flags & 0x4 == 0x4 { Some(flags & 0x2 == 0x2) } else { None };
        if flags & 0x8 == 0x8 {
            // Energy expenditure
            pos += 2;
        }

        let mut rr_intervals = vec![];
        if flags & 0x10 == 0x10 {
            // each RR value is 2 bytes, in 1/1024ths of a second
            for rr in data.get(pos..).unwrap_or_default().chunks_exact(2) {
                rr_intervals.push(u16::from_le_bytes([rr[0], rr[1]]) as f32 / 1024.0f32);
            }
        }

        Ok(HeartRate { bpm, in_contact, rr_intervals })
    }
}

/// Plays the part of the radio and a heart rate monitor for the session
async fn simulate_monitor(mut adapter: FakeAdapter, hrm: PeripheralId) {
    adapter.power_on();

    while let Some(command) = adapter.next_command().await {
        match command {
            FakeCommand::StartScanning(_) => {
                let scale = adapter.declare_peripheral();
                adapter.advertise(scale, Some("Scale"), &[ServiceId::from_u16(0x181D)]);
                adapter.advertise(hrm, Some("HRM Pro"), &[HEART_RATE]);
            }
            FakeCommand::Connect(peripheral) => {
                adapter.emit(BackendEvent::PeripheralConnected { peripheral });
            }
            FakeCommand::DiscoverServices(peripheral) => {
                adapter.emit(BackendEvent::ServicesDiscovered { peripheral,
                                                                services: vec![HEART_RATE],
                                                                error: None });
            }
            FakeCommand::DiscoverCharacteristics(peripheral, service) => {
                adapter.emit(BackendEvent::CharacteristicsDiscovered {
                    peripheral,
                    service,
                    characteristics: vec![(MEASUREMENT, CharacteristicProperties::NOTIFY),
                                          (BODY_LOCATION, CharacteristicProperties::READ)],
                    error: None,
                });
            }
            FakeCommand::Read(peripheral, characteristic) => {
                // Chest
                adapter.read_response(peripheral, characteristic, Ok(vec![1]));
            }
            FakeCommand::Subscribe(peripheral, characteristic) => {
                adapter.notification_state(peripheral, characteristic, true);
                let measurements: [&[u8]; 4] = [&[0x06, 62],
                                                 &[0x16, 64, 0x00, 0x04],
                                                 &[0x07, 0x10, 0x01],
                                                 &[0x04]];
                for measurement in measurements {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    adapter.notify(peripheral, characteristic, measurement);
                }
            }
            FakeCommand::Unsubscribe(peripheral, characteristic) => {
                adapter.notification_state(peripheral, characteristic, false);
            }
            FakeCommand::Disconnect(peripheral) => {
                adapter.emit(BackendEvent::PeripheralDisconnected { peripheral, error: None });
            }
            FakeCommand::StopScanning
            | FakeCommand::Write(..)
            | FakeCommand::CancelPending(_) => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder().filter_level(log::LevelFilter::Info) // Default Log Level
                         .parse_default_env()
                         .init();

    let (session, adapter) = SessionConfig::new().start_fake().await?;
    let hrm = adapter.declare_peripheral();
    tokio::spawn(simulate_monitor(adapter, hrm));

    // Queued until the adapter powers on
    let mut filter = Filter::new();
    filter.add_service(HEART_RATE);
    let monitor = session.scan_and_connect(filter).await?;
    info!("Connected to {} ({})", monitor.id(), monitor.name().unwrap_or("unnamed"));

    let location = session.read_as::<u8>(BODY_LOCATION).await?;
    info!("Sensor location: {}", location);

    session.listen_as::<HeartRate, _>(MEASUREMENT, |measurement| match measurement {
               Ok(hr) => {
                   info!("Heart Rate: {} bpm, contact: {:?}, RR: {:?}",
                         hr.bpm, hr.in_contact, hr.rr_intervals)
               }
               Err(err) => warn!("Bad measurement: {}", err),
           })
           .await?;

    tokio::time::sleep(Duration::from_secs(2)).await;

    session.end_listen(MEASUREMENT).await?;
    session.disconnect().await?;
    info!("Disconnected");

    Ok(())
}
