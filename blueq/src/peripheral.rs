use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use crate::characteristic::{CharacteristicInfo, CharacteristicProperties};
use crate::identifier::{CharacteristicId, PeripheralId, ServiceId};

// For the public API a Peripheral is a plain snapshot of what was
// discovered while connecting.
//
// It's notably not a handle back into the session; all requests go
// through the Session itself, which tracks the one connected
// peripheral, so holding on to a Peripheral never keeps any session
// state alive.

#[derive(Clone, PartialEq, Eq)]
pub struct Peripheral {
    id: PeripheralId,
    name: Option<String>,
    services: BTreeMap<ServiceId, Vec<CharacteristicInfo>>,
}

impl fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("id", &self.id.to_string())
            .field("name", &self.name)
            .field("services", &self.services.len())
            .finish()
    }
}

impl Peripheral {
    pub(crate) fn new(id: PeripheralId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            services: BTreeMap::new(),
        }
    }

    pub(crate) fn add_service(&mut self, service: ServiceId) {
        self.services.entry(service).or_insert_with(Vec::new);
    }

    pub(crate) fn add_characteristic(&mut self, id: CharacteristicId,
                                     properties: CharacteristicProperties) {
        let characteristics = self.services.entry(id.service()).or_insert_with(Vec::new);
        if !characteristics.iter().any(|info| info.id == id) {
            characteristics.push(CharacteristicInfo { id, properties });
        }
    }

    pub fn id(&self) -> PeripheralId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// All the services discovered while connecting, ordered by uuid
    pub fn services(&self) -> Vec<ServiceId> {
        self.services.keys().copied().collect()
    }

    pub fn has_service(&self, service: ServiceId) -> bool {
        self.services.contains_key(&service)
    }

    /// The characteristics discovered for `service`, in discovery order
    pub fn characteristics(&self, service: ServiceId) -> &[CharacteristicInfo] {
        self.services
            .get(&service)
            .map(|characteristics| characteristics.as_slice())
            .unwrap_or(&[])
    }

    pub fn characteristic(&self, id: CharacteristicId) -> Option<CharacteristicInfo> {
        self.characteristics(id.service())
            .iter()
            .find(|info| info.id == id)
            .copied()
    }
}

/// A peripheral seen while scanning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub service_ids: Vec<Uuid>,
}

impl DiscoveredPeripheral {
    pub fn has_service_id(&self, id: Uuid) -> bool {
        self.service_ids.contains(&id)
    }
}
