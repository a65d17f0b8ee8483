use bitflags::bitflags;

use crate::identifier::CharacteristicId;

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    /// Whether the characteristic can be listened to (via notifications or
    /// indications)
    pub fn is_listenable(&self) -> bool {
        self.intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE)
    }
}

/// A characteristic as discovered while connecting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub id: CharacteristicId,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    /// The write only completes once the peripheral acknowledges it
    WithResponse,

    /// The write completes as soon as the adapter has accepted it
    WithoutResponse,
}

impl Default for WriteType {
    fn default() -> Self {
        WriteType::WithResponse
    }
}
