//! The protocol session: discovery, registration, identification, polling.
//!
//! All transactions run strictly one at a time over the shared half-duplex
//! channel. A transaction that times out or returns a malformed payload is
//! logged and the enclosing operation yields an empty result; nothing here
//! retries, and only channel failures and address exhaustion abort the
//! session.

use crate::connection::{self, Transport};
use crate::device::{FieldSlot, Identity, Registry, RegistryError};
use crate::fields::Value;
use crate::protocol::{ACK, BROADCAST_ADDRESS, Function, Request};
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bus transaction failed")]
    Transport(#[from] connection::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// One decoded telemetry pass for one device.
///
/// Serializes as a flat JSON object: `device`, `timestamp`, then one entry
/// per decoded variable. Unknown field codes carry no variable name and are
/// not published.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device: String,
    pub timestamp: jiff::Timestamp,
    pub values: Vec<(&'static str, Value)>,
}

impl Reading {
    /// Flat `key=value` line with sorted value keys, for text-log sinks.
    pub fn kv_line(&self) -> String {
        let mut pairs: Vec<String> =
            self.values.iter().map(|(variable, value)| format!("{variable}={value}")).collect();
        pairs.sort();
        let mut parts = vec![format!("device={}", self.device), format!("timestamp={}", self.timestamp)];
        parts.extend(pairs);
        parts.join(" ")
    }

    pub fn value_of(&self, variable: &str) -> Option<Value> {
        self.values.iter().find(|(v, _)| *v == variable).map(|(_, value)| *value)
    }
}

impl serde::Serialize for Reading {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap as _;
        let mut map = serializer.serialize_map(Some(2 + self.values.len()))?;
        map.serialize_entry("device", &self.device)?;
        map.serialize_entry("timestamp", &self.timestamp.to_string())?;
        for (variable, value) in &self.values {
            map.serialize_entry(variable, value)?;
        }
        map.end()
    }
}

/// Pacing for the steady-state loop: the pause between telemetry passes and
/// the periodic device-discovery deadline.
///
/// Drives the tokio clock rather than wall time, so paused-clock tests can
/// step through passes without real delays.
pub struct Schedule {
    poll_interval: std::time::Duration,
    reregister_interval: std::time::Duration,
    next_registration: tokio::time::Instant,
}

impl Schedule {
    pub fn new(
        poll_interval: std::time::Duration,
        reregister_interval: std::time::Duration,
    ) -> Self {
        Self {
            poll_interval,
            reregister_interval,
            next_registration: tokio::time::Instant::now() + reregister_interval,
        }
    }

    /// Wait out the pause after a telemetry pass.
    ///
    /// Returns `true` when the re-registration deadline has passed and the
    /// caller should run another discovery cycle; the deadline then moves
    /// one interval ahead.
    pub async fn pass_complete(&mut self) -> bool {
        tokio::time::sleep(self.poll_interval).await;
        if tokio::time::Instant::now() >= self.next_registration {
            self.next_registration = tokio::time::Instant::now() + self.reregister_interval;
            true
        } else {
            false
        }
    }
}

pub struct Session<T> {
    transport: T,
    pub registry: Registry,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self { transport, registry: Registry::new() }
    }

    /// Broadcast a bus reset three times so every device answers the next
    /// offline query regardless of state left over from a previous run.
    pub async fn reset_bus(&mut self) -> Result<(), Error> {
        info!(message = "resetting the bus");
        for _ in 0..3 {
            let request = Request::new(BROADCAST_ADDRESS, Function::ReRegister, vec![]);
            self.transport.transact(&request).await?;
        }
        Ok(())
    }

    /// Run one registration cycle: a single offline query, and if a device
    /// answers, address assignment followed by identification and the
    /// description query.
    ///
    /// The bus arbitrates discovery collisions at the physical layer, so at
    /// most one device is brought in per cycle; the next cycle picks up any
    /// others. A failed step abandons the cycle without retrying.
    pub async fn register_cycle(&mut self) -> Result<(), Error> {
        info!(message = "running a registration cycle");
        let request = Request::new(BROADCAST_ADDRESS, Function::OfflineQuery, vec![]);
        let Some(reply) = self.transport.transact(&request).await? else {
            debug!(message = "no device answered the offline query");
            return Ok(());
        };
        if reply.payload.is_empty() {
            warn!(message = "offline query reply carried no serial number");
            return Ok(());
        }
        let serial = reply.payload;
        let serial_text = String::from_utf8_lossy(&serial).into_owned();
        let address = self.registry.assign_address()?;

        let mut payload = serial.clone();
        payload.push(address);
        let request = Request::new(BROADCAST_ADDRESS, Function::SendRegisterAddress, payload);
        let Some(ack) = self.transport.transact(&request).await? else {
            warn!(message = "address assignment was not acknowledged", serial = %serial_text);
            return Ok(());
        };
        if ack.payload.first() != Some(&ACK) {
            warn!(
                message = "wrong acknowledgement code for address assignment",
                serial = %serial_text,
                ack = ?ack.payload.first(),
            );
            return Ok(());
        }

        info!(message = "registered device", serial = %serial_text, address);
        self.registry.register(&serial, address);
        self.identify(&serial).await?;
        self.describe(&serial).await?;
        Ok(())
    }

    /// Fetch the informational identification record for a registered device.
    async fn identify(&mut self, serial: &[u8]) -> Result<(), Error> {
        let Some(address) = self.registry.get(serial).map(|d| d.address) else {
            return Ok(());
        };
        let request = Request::new(address, Function::QueryInverterId, vec![]);
        let Some(reply) = self.transport.transact(&request).await? else {
            warn!(message = "no reply to the inverter id query", address);
            return Ok(());
        };
        match Identity::from_payload(&reply.payload) {
            Err(e) => {
                warn!(
                    message = "could not decode the inverter id payload",
                    error = &e as &dyn std::error::Error,
                );
            }
            Ok(identity) => {
                info!(
                    message = "inverter identity",
                    phase = identity.phase,
                    rating = %identity.rating,
                    firmware = %identity.firmware,
                    model = %identity.model,
                    manufacturer = %identity.manufacturer,
                    serial = %identity.serial,
                    nominal_voltage = %identity.nominal_voltage,
                );
                if let Some(device) = self.registry.get_mut(serial) {
                    device.identity = Some(identity);
                }
            }
        }
        Ok(())
    }

    /// Fetch the field-code layout and build the device's field map.
    async fn describe(&mut self, serial: &[u8]) -> Result<(), Error> {
        let Some(address) = self.registry.get(serial).map(|d| d.address) else {
            return Ok(());
        };
        let request = Request::new(address, Function::QueryDescription, vec![]);
        let Some(reply) = self.transport.transact(&request).await? else {
            warn!(message = "no reply to the description query", address);
            return Ok(());
        };
        let map = crate::device::FieldMap::from_description(&reply.payload);
        for (index, slot) in map.slots().iter().enumerate() {
            match slot {
                FieldSlot::Known(field) => info!(
                    message = "field map slot",
                    index,
                    code = field.code(),
                    variable = field.variable(),
                    units = field.units(),
                ),
                FieldSlot::Unknown(code) => {
                    info!(message = "field map slot", index, code, variable = "(unknown)")
                }
            }
        }
        if let Some(device) = self.registry.get_mut(serial) {
            device.field_map = map;
        }
        Ok(())
    }

    /// Read one telemetry pass from one device.
    ///
    /// Returns `None` when the device does not answer within the response
    /// window or has no usable field map; other devices are unaffected.
    pub async fn poll_device(&mut self, serial: &[u8]) -> Result<Option<Reading>, Error> {
        let Some(device) = self.registry.get(serial) else {
            return Ok(None);
        };
        let address = device.address;
        let serial_text = device.serial_text();
        if device.field_map.is_empty() {
            debug!(message = "device has no field map yet", device = %serial_text);
            return Ok(None);
        }
        let request = Request::new(address, Function::QueryNormalInfo, vec![]);
        let Some(reply) = self.transport.transact(&request).await? else {
            warn!(message = "no telemetry reply", device = %serial_text, address);
            return Ok(None);
        };
        let Some(device) = self.registry.get(serial) else {
            return Ok(None);
        };
        let mut values: Vec<(&'static str, Value)> = Vec::new();
        for (index, slot, raw) in device.field_map.decode(&reply.payload) {
            let FieldSlot::Known(field) = slot else {
                debug!(message = "skipping unlabeled slot", index, raw);
                continue;
            };
            let value = field.value(raw);
            debug!(
                message = "decoded value",
                index,
                code = field.code(),
                variable = field.variable(),
                value = %value,
                units = field.units(),
            );
            // A device reporting the same code twice keeps the latest word.
            match values.iter_mut().find(|(variable, _)| *variable == field.variable()) {
                Some(entry) => entry.1 = value,
                None => values.push((field.variable(), value)),
            }
        }
        Ok(Some(Reading { device: serial_text, timestamp: jiff::Timestamp::now(), values }))
    }

    /// Poll every registered device in registration order.
    pub async fn poll_all(&mut self) -> Result<Vec<Reading>, Error> {
        let serials: Vec<Vec<u8>> = self.registry.iter().map(|d| d.serial.clone()).collect();
        let mut readings = Vec::with_capacity(serials.len());
        for serial in serials {
            if let Some(reading) = self.poll_device(&serial).await? {
                readings.push(reading);
            }
        }
        Ok(readings)
    }
}
