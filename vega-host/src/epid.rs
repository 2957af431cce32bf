//! Control-plane addressing.
//!
//! A 16-bit endpoint ID addresses a control endpoint on a device; a 10-bit
//! port number within that endpoint addresses one block. The runtime keeps
//! one table mapping `(device, block instance)` pairs to their endpoint and
//! port, filled in while the graph is brought up.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// A device-local endpoint ID.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epid(pub u16);

impl std::fmt::Display for Epid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A control port within an endpoint (10 bits).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CtrlPort(u16);

impl CtrlPort {
    /// Creates a control port; values above 10 bits are rejected.
    pub fn new(port: u16) -> Result<CtrlPort> {
        if port > 0x3FF {
            return Err(Error::Value(format!("control port {port} exceeds 10 bits")));
        }
        Ok(CtrlPort(port))
    }

    /// Returns the raw port number.
    pub fn get(&self) -> u16 {
        self.0
    }
}

/// The table from `(device, block instance)` to `(endpoint, port)`.
///
/// Endpoint IDs are handed out sequentially per map; id 0 is reserved for
/// the device info endpoint and never allocated.
#[derive(Debug, Default)]
pub struct EpidMap {
    next_epid: u16,
    map: HashMap<(u16, String), (Epid, CtrlPort)>,
}

impl EpidMap {
    /// Creates an empty map.
    pub fn new() -> EpidMap {
        EpidMap {
            next_epid: 1,
            map: HashMap::new(),
        }
    }

    /// Allocates an endpoint ID for a block instance and records the
    /// mapping. Registering the same instance twice is a value error.
    pub fn allocate(&mut self, device_id: u16, block: &str, port: CtrlPort) -> Result<Epid> {
        let key = (device_id, block.to_string());
        if self.map.contains_key(&key) {
            return Err(Error::Value(format!(
                "block {block} on device {device_id} already has an endpoint"
            )));
        }
        if self.next_epid == u16::MAX {
            return Err(Error::Value("endpoint ID space exhausted".to_string()));
        }
        let epid = Epid(self.next_epid);
        self.next_epid += 1;
        self.map.insert(key, (epid, port));
        Ok(epid)
    }

    /// Looks up the endpoint and port of a block instance.
    pub fn lookup(&self, device_id: u16, block: &str) -> Result<(Epid, CtrlPort)> {
        self.map
            .get(&(device_id, block.to_string()))
            .copied()
            .ok_or_else(|| {
                Error::Lookup(format!("no endpoint for block {block} on device {device_id}"))
            })
    }

    /// Returns the number of allocated endpoints.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns whether no endpoint has been allocated.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
