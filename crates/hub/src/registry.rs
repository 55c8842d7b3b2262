//! Authoritative table of imaging devices.
//!
//! Devices are keyed by a process-wide monotonic id and matched against
//! incoming pings by exact address. At most one device may hold a given
//! (plant, position) slot; `reassign` enforces this by evicting the previous
//! occupant back to unassigned.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::HubError;

/// Command handed to a device that has nothing pending.
pub const NO_COMMAND: &str = "NO_COMMAND";

/// Plant name cached on devices that are not assigned to a plant.
pub const UNASSIGNED_NAME: &str = "Unassigned";

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Capture slot of a device around its plant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Position {
    X,
    Y,
    Z,
    #[serde(rename = "U")]
    Unassigned,
}

impl Position {
    pub fn as_char(self) -> char {
        match self {
            Self::X => 'X',
            Self::Y => 'Y',
            Self::Z => 'Z',
            Self::Unassigned => 'U',
        }
    }

    pub fn is_assignable(self) -> bool {
        !matches!(self, Self::Unassigned)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl FromStr for Position {
    type Err = String;

    /// Parse a single-letter slot tag (case-insensitive, trims whitespace).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Self::X),
            "Y" => Ok(Self::Y),
            "Z" => Ok(Self::Z),
            "U" => Ok(Self::Unassigned),
            other => Err(format!("unknown position '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub id: u64,
    pub address: String,
    /// 0 = unassigned, otherwise the 1-based plant index.
    pub plant_ref: u32,
    /// Plant name at assignment time; not refreshed on rename.
    pub plant_name: String,
    pub position: Position,
    /// Unix seconds of the most recent matched ping.
    pub last_seen: i64,
    pub pending_command: String,
    #[serde(skip)]
    pub seen_this_cycle: bool,
}

impl Device {
    fn fresh(id: u64, address: &str, ts: i64) -> Self {
        Self {
            id,
            address: address.to_string(),
            plant_ref: 0,
            plant_name: UNASSIGNED_NAME.to_string(),
            position: Position::Unassigned,
            last_seen: ts,
            pending_command: NO_COMMAND.to_string(),
            seen_this_cycle: true,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.plant_ref != 0 && self.position.is_assignable()
    }

    fn holds(&self, plant_ref: u32, position: Position) -> bool {
        self.plant_ref == plant_ref && self.position == position
    }

    /// Drop the device back to the unassigned pool. A displaced device also
    /// loses whatever command was queued for its old slot.
    fn clear_assignment(&mut self) {
        self.plant_ref = 0;
        self.plant_name = UNASSIGNED_NAME.to_string();
        self.position = Position::Unassigned;
        self.pending_command = NO_COMMAND.to_string();
    }
}

/// Result of matching one address against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Refreshed(u64),
    Created(u64),
}

#[cfg(test)]
impl Upsert {
    pub fn id(self) -> u64 {
        match self {
            Self::Refreshed(id) | Self::Created(id) => id,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u64, Device>,
    next_id: u64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the table from persisted devices. The id counter resumes at
    /// the highest restored id + 1. A slot claimed by more than one restored
    /// device stays with the lowest id; the others are unassigned.
    pub fn restore(devices: Vec<Device>) -> Self {
        let mut registry = Self::new();
        for mut device in devices {
            device.seen_this_cycle = false;
            registry.next_id = registry.next_id.max(device.id + 1);
            registry.devices.insert(device.id, device);
        }

        let mut claimed: Vec<(u32, Position)> = Vec::new();
        for device in registry.devices.values_mut() {
            if !device.is_assigned() {
                continue;
            }
            let slot = (device.plant_ref, device.position);
            if claimed.contains(&slot) {
                warn!(
                    device_id = device.id,
                    plant_ref = slot.0,
                    position = %slot.1,
                    "registry: slot already held by another restored device, unassigning"
                );
                device.clear_assignment();
            } else {
                claimed.push(slot);
            }
        }

        registry
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Id the next created device will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Clear every `seen_this_cycle` flag; called at the start of each tick.
    pub fn begin_cycle(&mut self) {
        for device in self.devices.values_mut() {
            device.seen_this_cycle = false;
        }
    }

    #[cfg(test)]
    pub fn find_by_address(&self, address: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.address == address)
    }

    /// Mark the device with this address as seen at `ts`, or create a new
    /// unassigned device for it.
    pub fn upsert_by_address(&mut self, address: &str, ts: i64) -> Upsert {
        if let Some(device) = self.devices.values_mut().find(|d| d.address == address) {
            device.last_seen = ts;
            device.seen_this_cycle = true;
            return Upsert::Refreshed(device.id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.devices.insert(id, Device::fresh(id, address, ts));
        Upsert::Created(id)
    }

    pub fn get(&self, id: u64) -> Option<&Device> {
        self.devices.get(&id)
    }

    /// Snapshot of every device, ordered by id.
    pub fn list(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Devices holding a slot on `plant_ref`, ordered by position.
    pub fn assigned_to(&self, plant_ref: u32) -> Vec<&Device> {
        let mut assigned: Vec<&Device> = self
            .devices
            .values()
            .filter(|d| d.is_assigned() && d.plant_ref == plant_ref)
            .collect();
        assigned.sort_by_key(|d| (d.position, d.id));
        assigned
    }

    /// Move a device into the (plant, position) slot. Any other device
    /// holding that slot is reset to unassigned; their ids are returned.
    ///
    /// The caller is responsible for checking that `plant_ref` names a plant
    /// in the catalog.
    pub fn reassign(
        &mut self,
        id: u64,
        plant_ref: u32,
        plant_name: &str,
        position: Position,
    ) -> Result<Vec<u64>, HubError> {
        if !self.devices.contains_key(&id) {
            return Err(HubError::UnknownDevice(id));
        }
        if plant_ref == 0 {
            return Err(HubError::UnknownPlant(plant_ref));
        }
        if !position.is_assignable() {
            return Err(HubError::UnassignablePosition(position));
        }

        let mut displaced = Vec::new();
        for device in self.devices.values_mut() {
            if device.id != id && device.holds(plant_ref, position) {
                device.clear_assignment();
                displaced.push(device.id);
            }
        }

        let device = self
            .devices
            .get_mut(&id)
            .ok_or(HubError::UnknownDevice(id))?;
        device.plant_ref = plant_ref;
        device.plant_name = plant_name.to_string();
        device.position = position;

        Ok(displaced)
    }

    pub fn set_command(&mut self, id: u64, command: &str) -> Result<(), HubError> {
        let device = self
            .devices
            .get_mut(&id)
            .ok_or(HubError::UnknownDevice(id))?;
        let command = command.trim();
        device.pending_command = if command.is_empty() {
            NO_COMMAND.to_string()
        } else {
            command.to_string()
        };
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<Device> {
        self.devices.remove(&id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn restored(id: u64, address: &str, plant_ref: u32, position: Position) -> Device {
        Device {
            id,
            address: address.into(),
            plant_ref,
            plant_name: if plant_ref == 0 {
                UNASSIGNED_NAME.into()
            } else {
                format!("plant-{plant_ref}")
            },
            position,
            last_seen: 1_000,
            pending_command: NO_COMMAND.into(),
            seen_this_cycle: true,
        }
    }

    // -- Position ----------------------------------------------------------

    #[test]
    fn position_parse_is_case_insensitive() {
        assert_eq!("x".parse::<Position>(), Ok(Position::X));
        assert_eq!(" Z ".parse::<Position>(), Ok(Position::Z));
        assert_eq!("U".parse::<Position>(), Ok(Position::Unassigned));
    }

    #[test]
    fn position_parse_rejects_garbage() {
        assert!("Q".parse::<Position>().is_err());
        assert!("XY".parse::<Position>().is_err());
        assert!("".parse::<Position>().is_err());
    }

    #[test]
    fn position_serializes_as_single_letter() {
        assert_eq!(serde_json::to_string(&Position::Y).unwrap(), "\"Y\"");
        assert_eq!(serde_json::to_string(&Position::Unassigned).unwrap(), "\"U\"");
    }

    // -- upsert_by_address -------------------------------------------------

    #[test]
    fn upsert_creates_unassigned_device() {
        let mut reg = DeviceRegistry::new();
        let up = reg.upsert_by_address("10.0.0.5", 500);

        assert_eq!(up, Upsert::Created(0));
        let d = reg.get(0).unwrap();
        assert_eq!(d.address, "10.0.0.5");
        assert_eq!(d.plant_ref, 0);
        assert_eq!(d.plant_name, UNASSIGNED_NAME);
        assert_eq!(d.position, Position::Unassigned);
        assert_eq!(d.pending_command, NO_COMMAND);
        assert_eq!(d.last_seen, 500);
        assert!(d.seen_this_cycle);
    }

    #[test]
    fn upsert_existing_only_refreshes_liveness() {
        let mut reg = DeviceRegistry::restore(vec![restored(4, "10.0.0.5", 1, Position::X)]);
        reg.set_command(4, "CAPTURE").unwrap();

        let up = reg.upsert_by_address("10.0.0.5", 2_000);

        assert_eq!(up, Upsert::Refreshed(4));
        assert_eq!(reg.len(), 1);
        let d = reg.get(4).unwrap();
        assert_eq!(d.last_seen, 2_000);
        assert!(d.seen_this_cycle);
        assert_eq!(d.plant_ref, 1);
        assert_eq!(d.position, Position::X);
        assert_eq!(d.pending_command, "CAPTURE");
    }

    #[test]
    fn upsert_matches_address_exactly() {
        let mut reg = DeviceRegistry::new();
        reg.upsert_by_address("10.0.0.5", 1);
        let up = reg.upsert_by_address("10.0.0.50", 1);
        assert_eq!(up, Upsert::Created(1));
    }

    // -- id counter --------------------------------------------------------

    #[test]
    fn restore_resumes_counter_after_max_id() {
        let reg = DeviceRegistry::restore(vec![
            restored(3, "a", 0, Position::Unassigned),
            restored(17, "b", 0, Position::Unassigned),
            restored(9, "c", 0, Position::Unassigned),
        ]);
        assert_eq!(reg.next_id(), 18);
    }

    #[test]
    fn ids_never_repeat_after_removal() {
        let mut reg = DeviceRegistry::new();
        let a = reg.upsert_by_address("a", 1).id();
        reg.remove(a);
        let b = reg.upsert_by_address("b", 1).id();
        assert_ne!(a, b);
        assert_eq!(b, 1);
    }

    #[test]
    fn restore_clears_seen_flags() {
        let reg = DeviceRegistry::restore(vec![restored(1, "a", 0, Position::Unassigned)]);
        assert!(!reg.get(1).unwrap().seen_this_cycle);
    }

    #[test]
    fn restore_resolves_duplicate_slot_to_lowest_id() {
        let reg = DeviceRegistry::restore(vec![
            restored(8, "b", 2, Position::X),
            restored(2, "a", 2, Position::X),
        ]);
        assert_eq!(reg.get(2).unwrap().position, Position::X);
        assert_eq!(reg.get(8).unwrap().position, Position::Unassigned);
        assert_eq!(reg.get(8).unwrap().plant_ref, 0);
    }

    // -- begin_cycle -------------------------------------------------------

    #[test]
    fn begin_cycle_resets_every_flag() {
        let mut reg = DeviceRegistry::new();
        reg.upsert_by_address("a", 1);
        reg.upsert_by_address("b", 1);
        reg.begin_cycle();
        assert!(reg.iter().all(|d| !d.seen_this_cycle));
    }

    // -- reassign ----------------------------------------------------------

    #[test]
    fn reassign_sets_slot_and_name_cache() {
        let mut reg = DeviceRegistry::new();
        let id = reg.upsert_by_address("a", 1).id();

        let displaced = reg.reassign(id, 2, "Basil", Position::Y).unwrap();

        assert!(displaced.is_empty());
        let d = reg.get(id).unwrap();
        assert_eq!(d.plant_ref, 2);
        assert_eq!(d.plant_name, "Basil");
        assert_eq!(d.position, Position::Y);
    }

    #[test]
    fn reassign_displaces_previous_occupant() {
        let mut reg = DeviceRegistry::new();
        let a = reg.upsert_by_address("a", 1).id();
        let b = reg.upsert_by_address("b", 1).id();
        reg.reassign(b, 2, "Basil", Position::X).unwrap();
        reg.set_command(b, "CAPTURE").unwrap();

        let displaced = reg.reassign(a, 2, "Basil", Position::X).unwrap();

        assert_eq!(displaced, vec![b]);
        let b_dev = reg.get(b).unwrap();
        assert_eq!(b_dev.position, Position::Unassigned);
        assert_eq!(b_dev.plant_ref, 0);
        assert_eq!(b_dev.plant_name, UNASSIGNED_NAME);
        assert_eq!(b_dev.pending_command, NO_COMMAND);

        let holders: Vec<_> = reg.iter().filter(|d| d.holds(2, Position::X)).collect();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].id, a);
    }

    #[test]
    fn reassign_same_slot_to_same_device_is_noop() {
        let mut reg = DeviceRegistry::new();
        let a = reg.upsert_by_address("a", 1).id();
        reg.reassign(a, 1, "Mint", Position::Z).unwrap();
        let displaced = reg.reassign(a, 1, "Mint", Position::Z).unwrap();
        assert!(displaced.is_empty());
        assert_eq!(reg.get(a).unwrap().position, Position::Z);
    }

    #[test]
    fn reassign_moving_device_vacates_old_slot() {
        let mut reg = DeviceRegistry::new();
        let a = reg.upsert_by_address("a", 1).id();
        reg.reassign(a, 1, "Mint", Position::X).unwrap();
        reg.reassign(a, 2, "Basil", Position::Y).unwrap();
        assert!(reg.assigned_to(1).is_empty());
        assert_eq!(reg.assigned_to(2).len(), 1);
    }

    #[test]
    fn reassign_unknown_device_rejected() {
        let mut reg = DeviceRegistry::new();
        assert_eq!(
            reg.reassign(42, 1, "Mint", Position::X),
            Err(HubError::UnknownDevice(42))
        );
    }

    #[test]
    fn reassign_to_unassigned_position_rejected() {
        let mut reg = DeviceRegistry::new();
        let a = reg.upsert_by_address("a", 1).id();
        assert_eq!(
            reg.reassign(a, 1, "Mint", Position::Unassigned),
            Err(HubError::UnassignablePosition(Position::Unassigned))
        );
    }

    #[test]
    fn reassign_to_plant_zero_rejected() {
        let mut reg = DeviceRegistry::new();
        let a = reg.upsert_by_address("a", 1).id();
        assert_eq!(
            reg.reassign(a, 0, "Mint", Position::X),
            Err(HubError::UnknownPlant(0))
        );
    }

    // -- assigned_to -------------------------------------------------------

    #[test]
    fn assigned_to_orders_by_position() {
        let mut reg = DeviceRegistry::new();
        let a = reg.upsert_by_address("a", 1).id();
        let b = reg.upsert_by_address("b", 1).id();
        let c = reg.upsert_by_address("c", 1).id();
        reg.reassign(a, 1, "Mint", Position::Z).unwrap();
        reg.reassign(b, 1, "Mint", Position::X).unwrap();
        reg.reassign(c, 2, "Basil", Position::Y).unwrap();

        let positions: Vec<_> = reg.assigned_to(1).iter().map(|d| d.position).collect();
        assert_eq!(positions, vec![Position::X, Position::Z]);
    }

    // -- set_command / remove ----------------------------------------------

    #[test]
    fn set_command_blank_falls_back_to_no_command() {
        let mut reg = DeviceRegistry::new();
        let a = reg.upsert_by_address("a", 1).id();
        reg.set_command(a, "REBOOT").unwrap();
        reg.set_command(a, "   ").unwrap();
        assert_eq!(reg.get(a).unwrap().pending_command, NO_COMMAND);
    }

    #[test]
    fn set_command_unknown_device_rejected() {
        let mut reg = DeviceRegistry::new();
        assert_eq!(reg.set_command(1, "X"), Err(HubError::UnknownDevice(1)));
    }

    #[test]
    fn remove_returns_device() {
        let mut reg = DeviceRegistry::new();
        let a = reg.upsert_by_address("a", 1).id();
        assert_eq!(reg.remove(a).map(|d| d.address), Some("a".to_string()));
        assert!(reg.is_empty());
        assert!(reg.remove(a).is_none());
    }
}
