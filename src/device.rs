//! Device records, their telemetry field maps, and the bus registry.

use crate::fields::FieldIndex;
use crate::protocol::FIRST_DEVICE_ADDRESS;

/// One telemetry slot as announced by a description-query response.
///
/// Unknown codes stay in the map so that later slots keep their positions;
/// they decode as raw words with no variable name attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSlot {
    Known(FieldIndex),
    Unknown(u8),
}

/// Ordered slot-index → field table for one device.
///
/// Built once per registration epoch. A device that re-registers may run
/// different firmware, so the map is discarded and rebuilt every time.
#[derive(Debug, Clone, Default)]
pub struct FieldMap(Vec<FieldSlot>);

impl FieldMap {
    /// One byte of description payload per telemetry slot, in wire order.
    pub fn from_description(payload: &[u8]) -> Self {
        Self(
            payload
                .iter()
                .map(|&code| match FieldIndex::from_code(code) {
                    Some(field) => FieldSlot::Known(field),
                    None => FieldSlot::Unknown(code),
                })
                .collect(),
        )
    }

    pub fn slots(&self) -> &[FieldSlot] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pair each big-endian telemetry word with its slot.
    ///
    /// Words beyond the described slots and a trailing odd byte are dropped.
    pub fn decode<'a>(
        &'a self,
        payload: &'a [u8],
    ) -> impl Iterator<Item = (usize, FieldSlot, u16)> + 'a {
        payload
            .chunks_exact(2)
            .enumerate()
            .filter_map(|(index, word)| {
                let raw = u16::from_be_bytes([word[0], word[1]]);
                self.0.get(index).map(|slot| (index, *slot, raw))
            })
    }
}

#[derive(thiserror::Error, Debug)]
#[error("inverter id payload is {0} bytes, expected at least 64")]
pub struct IdentityTooShort(pub usize);

/// The fixed identification record a device reports once after registration.
///
/// Informational only; telemetry decoding does not depend on it.
#[derive(Debug, Clone)]
pub struct Identity {
    pub phase: u8,
    pub rating: String,
    pub firmware: String,
    pub model: String,
    pub manufacturer: String,
    pub serial: String,
    pub nominal_voltage: String,
}

impl Identity {
    pub const WIRE_LEN: usize = 64;

    /// Decode the phase(1) rating(6) firmware(5) model(16) manufacturer(16)
    /// serial(16) nominal-voltage(4) layout.
    pub fn from_payload(payload: &[u8]) -> Result<Identity, IdentityTooShort> {
        if payload.len() < Self::WIRE_LEN {
            return Err(IdentityTooShort(payload.len()));
        }
        fn text(bytes: &[u8]) -> String {
            String::from_utf8_lossy(bytes)
                .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string()
        }
        Ok(Identity {
            phase: payload[0],
            rating: text(&payload[1..7]),
            firmware: text(&payload[7..12]),
            model: text(&payload[12..28]),
            manufacturer: text(&payload[28..44]),
            serial: text(&payload[44..60]),
            nominal_voltage: text(&payload[60..64]),
        })
    }
}

/// One inverter known to the controller.
#[derive(Debug, Clone)]
pub struct Device {
    /// Factory serial number, the registry key.
    pub serial: Vec<u8>,
    /// Bus address assigned at registration; replaced on re-registration.
    pub address: u8,
    pub field_map: FieldMap,
    pub identity: Option<Identity>,
}

impl Device {
    pub fn serial_text(&self) -> String {
        String::from_utf8_lossy(&self.serial).into_owned()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("bus address space exhausted (every address 0x10..=0xFF has been assigned)")]
    AddressSpaceExhausted,
}

/// Serial → device mapping plus the monotonic address counter.
///
/// Owned by the session controller; there is exactly one thread of control,
/// so no interior locking. Addresses are never recycled within a process
/// lifetime, and running out of them has no recovery path.
pub struct Registry {
    devices: Vec<Device>,
    next_address: u16,
}

impl Registry {
    pub fn new() -> Self {
        Self { devices: Vec::new(), next_address: u16::from(FIRST_DEVICE_ADDRESS) }
    }

    /// Hand out the next bus address.
    pub fn assign_address(&mut self) -> Result<u8, RegistryError> {
        let address =
            u8::try_from(self.next_address).map_err(|_| RegistryError::AddressSpaceExhausted)?;
        self.next_address += 1;
        Ok(address)
    }

    /// Create or replace the record for `serial`.
    ///
    /// Re-registration keeps the device's position in polling order but
    /// resets the field map and identity, which must be fetched again.
    pub fn register(&mut self, serial: &[u8], address: u8) -> &mut Device {
        let device = Device {
            serial: serial.to_vec(),
            address,
            field_map: FieldMap::default(),
            identity: None,
        };
        match self.devices.iter().position(|d| d.serial == serial) {
            Some(index) => {
                self.devices[index] = device;
                &mut self.devices[index]
            }
            None => {
                self.devices.push(device);
                self.devices.last_mut().expect("just pushed")
            }
        }
    }

    pub fn get(&self, serial: &[u8]) -> Option<&Device> {
        self.devices.iter().find(|d| d.serial == serial)
    }

    pub fn get_mut(&mut self, serial: &[u8]) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.serial == serial)
    }

    /// Devices in registration order, the order telemetry polling uses.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Value;

    #[test]
    fn field_map_preserves_wire_order() {
        let map = FieldMap::from_description(&[0x01, 0x00, 0x03, 0x0b]);
        let slots = map.slots();
        assert_eq!(slots.len(), 4);
        assert!(matches!(slots[0], FieldSlot::Known(f) if f.variable() == "v_pv1"));
        assert!(matches!(slots[1], FieldSlot::Known(f) if f.variable() == "temp"));
        // 0x03 is not in the catalog but must keep its position.
        assert_eq!(slots[2], FieldSlot::Unknown(0x03));
        assert!(matches!(slots[3], FieldSlot::Known(f) if f.variable() == "p_ac"));
    }

    #[test]
    fn empty_description_builds_empty_map() {
        let map = FieldMap::from_description(&[]);
        assert!(map.is_empty());
        assert_eq!(map.decode(&[0x00, 0x01]).count(), 0);
    }

    #[test]
    fn decode_splits_big_endian_words() {
        let map = FieldMap::from_description(&[0x00, 0x01]);
        let decoded: Vec<_> = map.decode(&[0x00, 0x7b, 0x00, 0x0a]).collect();
        assert_eq!(decoded.len(), 2);
        let (_, FieldSlot::Known(temp), raw) = decoded[0] else {
            panic!("slot 0 should be known");
        };
        assert_eq!(raw, 123);
        let Value::Scaled(v) = temp.value(raw) else {
            panic!("temp should scale");
        };
        assert!((v - 12.3).abs() < 1e-9);
    }

    #[test]
    fn decode_ignores_trailing_odd_byte_and_extra_words() {
        let map = FieldMap::from_description(&[0x00]);
        let decoded: Vec<_> = map.decode(&[0x00, 0x01, 0x00, 0x02, 0xFF]).collect();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn identity_decodes_fixed_layout() {
        let mut payload = Vec::new();
        payload.push(3u8);
        payload.extend_from_slice(b"4600W\0");
        payload.extend_from_slice(b"1.2.3");
        payload.extend_from_slice(b"TL4600          ");
        payload.extend_from_slice(b"Eversolar       ");
        payload.extend_from_slice(b"ABC123\0\0\0\0\0\0\0\0\0\0");
        payload.extend_from_slice(b"230V");
        let identity = Identity::from_payload(&payload).unwrap();
        assert_eq!(identity.phase, 3);
        assert_eq!(identity.rating, "4600W");
        assert_eq!(identity.firmware, "1.2.3");
        assert_eq!(identity.model, "TL4600");
        assert_eq!(identity.manufacturer, "Eversolar");
        assert_eq!(identity.serial, "ABC123");
        assert_eq!(identity.nominal_voltage, "230V");
    }

    #[test]
    fn identity_rejects_short_payload() {
        assert!(Identity::from_payload(&[0u8; 63]).is_err());
    }

    #[test]
    fn addresses_are_monotonic_and_never_reused() {
        let mut registry = Registry::new();
        assert_eq!(registry.assign_address().unwrap(), 0x10);
        assert_eq!(registry.assign_address().unwrap(), 0x11);
        registry.register(b"S1", 0x10);
        registry.register(b"S1", 0x11);
        // Replacing a registration does not return its old address.
        assert_eq!(registry.assign_address().unwrap(), 0x12);
    }

    #[test]
    fn address_space_exhaustion_is_an_error() {
        let mut registry = Registry::new();
        for expected in 0x10..=0xFFu16 {
            assert_eq!(u16::from(registry.assign_address().unwrap()), expected);
        }
        assert!(matches!(
            registry.assign_address(),
            Err(RegistryError::AddressSpaceExhausted)
        ));
    }

    #[test]
    fn reregistration_replaces_in_place_and_resets_the_field_map() {
        let mut registry = Registry::new();
        registry.register(b"S1", 0x10).field_map = FieldMap::from_description(&[0x00]);
        registry.register(b"S2", 0x11);
        registry.register(b"S1", 0x12);
        let order: Vec<_> = registry.iter().map(|d| d.serial_text()).collect();
        assert_eq!(order, ["S1", "S2"]);
        let s1 = registry.get(b"S1").unwrap();
        assert_eq!(s1.address, 0x12);
        assert!(s1.field_map.is_empty());
    }
}
