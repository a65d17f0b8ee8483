//! A serialized GATT operation queue and connection state machine for
//! Bluetooth LE centrals.
//!
//! A [`Session`] wraps an asynchronous, event driven hardware adapter
//! (anything implementing [`BackendSession`]) that only tolerates one GATT
//! operation in flight at a time. Application requests (scan, connect,
//! read, write, listen...) are queued and executed one at a time, each
//! resolving exactly once with a success value or a typed [`Error`].

use uuid::Uuid;

pub mod identifier;
pub use identifier::{uuid_from_u16, CharacteristicId, PeripheralHandle, PeripheralId, ServiceId};

pub mod characteristic;
pub use characteristic::{CharacteristicInfo, CharacteristicProperties, WriteType};

pub mod peripheral;
pub use peripheral::{DiscoveredPeripheral, Peripheral};

pub mod codec;

pub mod observer;
pub use observer::ConnectionObserver;

pub mod listen;
pub use listen::{ListenRestorer, RESTORE_BUFFER_CAPACITY};

pub mod state;
pub use state::ConnectionState;

pub mod queue;
pub use queue::{Completion, OperationId};

mod driver;

pub mod session;
pub use session::{BackendBus, BackendSession, Filter, ScanStream, Session, SessionConfig};

pub mod fake;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Insufficient Authentication")]
    InsufficientAuthentication,

    #[error("Insufficient Authorization")]
    InsufficientAuthorization,

    #[error("Insufficient Encryption")]
    InsufficientEncryption,

    #[error("Read Not Permitted")]
    ReadNotPermitted,

    #[error("Write Not Permitted")]
    WriteNotPermitted,

    #[error("Unsupported request")]
    Unsupported,

    #[error("Congested")]
    Congested,

    #[error("General Failure: {0}")]
    GeneralFailure(String),
}

/// Events emitted by a hardware adapter backend
///
/// Backends send these through their [`BackendBus`] whenever a command
/// completes and also for anything unsolicited (a peripheral dropping the
/// link, the adapter powering off, a relaunch restoring subscriptions).
#[derive(Clone, Debug)]
pub enum BackendEvent {
    AdapterPowerChanged {
        powered_on: bool,
    },
    PeripheralDiscovered {
        peripheral: PeripheralId,
        name: Option<String>,
        rssi: Option<i16>,
        service_ids: Vec<Uuid>,
    },
    PeripheralConnected {
        peripheral: PeripheralId,
    },
    PeripheralConnectionFailed {
        peripheral: PeripheralId,
        error: Option<GattError>,
    },
    PeripheralDisconnected {
        peripheral: PeripheralId,
        error: Option<GattError>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<ServiceId>,
        error: Option<GattError>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: ServiceId,
        characteristics: Vec<(CharacteristicId, CharacteristicProperties)>,
        error: Option<GattError>,
    },
    ValueRead {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: std::result::Result<Vec<u8>, GattError>,
    },
    ValueWritten {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        error: Option<GattError>,
    },
    ValueUpdated {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },

    /// Acknowledges a `subscribe` (enabled) or `unsubscribe` (disabled)
    NotificationStateChanged {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        enabled: bool,
        error: Option<GattError>,
    },

    /// Sent once on relaunch, before any application request, listing the
    /// subscriptions that were active when the process was suspended
    RestorationCandidates {
        peripheral: PeripheralId,
        characteristics: Vec<CharacteristicId>,
    },
}

/// Availability and connection transitions, as a stream
///
/// The same transitions are delivered to any registered
/// [`ConnectionObserver`]s; this is the alternative for applications that
/// would rather consume a `Stream`.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    #[non_exhaustive]
    AvailabilityChanged {
        available: bool,
    },

    #[non_exhaustive]
    StateChanged {
        state: ConnectionState,
    },

    #[non_exhaustive]
    PeripheralConnected {
        peripheral: Peripheral,
    },

    /// Indicates that the connected peripheral has disconnected.
    ///
    /// By the time this is seen every operation that depended on the link
    /// has already failed with `Error::Disconnected` and every listen on the
    /// peripheral has ended.
    PeripheralDisconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bluetooth is powered off or unsupported")]
    AdapterUnavailable,

    #[error("Timed out while connecting to the peripheral")]
    ConnectionTimeout,

    #[error("Failed to connect to the peripheral")]
    ConnectionFailed(Option<GattError>),

    #[error("The peripheral disconnected while the operation was in flight")]
    Disconnected,

    #[error("The operation timed out")]
    OperationTimeout,

    #[error("No peripheral is connected")]
    NotConnected,

    #[error("Already listening to this characteristic")]
    AlreadyListening,

    #[error("Not listening to this characteristic")]
    NotListening,

    #[error("Failed to decode value: {0}")]
    DecodeFailed(String),

    #[error("Failed to encode value: {0}")]
    EncodeFailed(String),

    #[error("The operation was cancelled")]
    Cancelled,

    #[error("There was a GATT communication protocol error")]
    PeripheralGattProtocolError(#[from] GattError),

    #[error("The system doesn't support this request / operation")]
    Unsupported,

    #[error("The session has been closed")]
    SessionClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
