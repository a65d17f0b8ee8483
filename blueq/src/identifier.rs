use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

// Const so that applications can declare their service and characteristic
// ids as consts.
pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

/// Returns the 16-bit short form of `uuid` if it's derived from the
/// Bluetooth base UUID.
pub fn uuid_as_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

fn fmt_uuid(uuid: &Uuid, f: &mut fmt::Formatter) -> fmt::Result {
    match uuid_as_u16(uuid) {
        Some(short) => write!(f, "{:04X}", short),
        None => write!(f, "{}", uuid),
    }
}

/// An opaque, backend-specific handle for a peripheral
///
/// Handles are only meaningful to the backend that allocated them and
/// shouldn't be persisted across sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralHandle(pub u32);

/// Identifies a specific physical peripheral for the lifetime of a session
///
/// Obtained from a scan result (or from a restoration notice) and immutable
/// from then on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId {
    handle: PeripheralHandle,
    uuid: Uuid,
}

impl PeripheralId {
    pub fn new(handle: PeripheralHandle, uuid: Uuid) -> Self {
        Self { handle, uuid }
    }

    pub fn handle(&self) -> PeripheralHandle {
        self.handle
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.handle.0, self.uuid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(Uuid);

impl ServiceId {
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn from_u16(v: u16) -> Self {
        Self(uuid_from_u16(v))
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_uuid(&self.0, f)
    }
}

/// A characteristic, keyed by its own uuid plus the service that owns it
///
/// Two characteristics with the same uuid under different services are
/// distinct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicId {
    service: ServiceId,
    uuid: Uuid,
}

impl CharacteristicId {
    pub const fn new(uuid: Uuid, service: ServiceId) -> Self {
        Self { service, uuid }
    }

    pub const fn from_u16(v: u16, service: ServiceId) -> Self {
        Self::new(uuid_from_u16(v), service)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_uuid(&self.uuid, f)?;
        write!(f, "@")?;
        fmt_uuid(&self.service.0, f)
    }
}
