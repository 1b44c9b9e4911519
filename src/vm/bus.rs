//! The device-bus boundary of the interpreter.
//!
//! The VM never talks to hardware directly; everything flows through the
//! [`Bus`] trait so tests can drive the interpreter with a [`MockBus`].

use crate::error::RuntimeResult;

use std::collections::HashMap;

/// Command bit set on event packets.
pub const CMD_EVENT: u16 = 0x8000;
/// Command bit set on register reports.
pub const CMD_REG_REPORT: u16 = 0x1000;
/// Mask extracting the event or register code.
pub const CMD_CODE_MASK: u16 = 0xfff;

/// A service packet as seen by the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub device_id: u64,
    pub service_index: u8,
    pub cmd: u16,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn event(device_id: u64, service_index: u8, code: u16, data: Vec<u8>) -> Self {
        Self {
            device_id,
            service_index,
            cmd: CMD_EVENT | (code & CMD_CODE_MASK),
            data,
        }
    }

    pub fn register_report(device_id: u64, service_index: u8, code: u16, data: Vec<u8>) -> Self {
        Self {
            device_id,
            service_index,
            cmd: CMD_REG_REPORT | (code & CMD_CODE_MASK),
            data,
        }
    }

    /// Synthetic packet delivered to role observers when their device
    /// drops off the bus.
    pub fn disconnected(device_id: u64, service_index: u8) -> Self {
        Self {
            device_id,
            service_index,
            cmd: 0,
            data: Vec::new(),
        }
    }

    pub fn event_code(&self) -> Option<u16> {
        if self.cmd & CMD_EVENT != 0 {
            Some(self.cmd & CMD_CODE_MASK)
        } else {
            None
        }
    }

    pub fn register_code(&self) -> Option<u16> {
        if self.cmd & CMD_EVENT == 0 && self.cmd & CMD_REG_REPORT != 0 {
            Some(self.cmd & CMD_CODE_MASK)
        } else {
            None
        }
    }

    pub fn is_disconnect(&self) -> bool {
        self.cmd == 0 && self.data.is_empty()
    }
}

/// Everything the interpreter needs from the transport below it.
pub trait Bus {
    /// Milliseconds since an arbitrary epoch.
    fn now(&self) -> u64;

    /// First service instance on the bus implementing `class`.
    fn find_service(&mut self, class: u32) -> Option<(u64, u8)>;

    /// Cached register payload no older than `max_age_ms`
    /// (0 means any age is acceptable).
    fn cached_register(
        &mut self,
        device_id: u64,
        service_index: u8,
        code: u16,
        max_age_ms: u32,
    ) -> Option<Vec<u8>>;

    /// Ask the device to report a register.
    fn query_register(&mut self, device_id: u64, service_index: u8, code: u16);

    /// Write a register value.
    fn set_register(&mut self, device_id: u64, service_index: u8, code: u16, data: &[u8]);

    fn cloud_upload(&mut self, label: &str, values: &[f64]) -> RuntimeResult<()>;

    /// Request a `timer_fired` callback no later than `at` (ms).
    fn set_timer(&mut self, at: u64);
}

/// In-memory bus for tests: a fixed set of services, scripted register
/// caches, and logs of everything the interpreter sent.
#[derive(Debug, Default)]
pub struct MockBus {
    pub now: u64,
    /// (device_id, service_index, service_class)
    pub services: Vec<(u64, u8, u32)>,
    /// Scripted register caches; fresh unless an entry in
    /// `register_times` says otherwise
    pub registers: HashMap<(u64, u8, u16), Vec<u8>>,
    /// Timestamp a scripted cache entry was "reported" at
    pub register_times: HashMap<(u64, u8, u16), u64>,
    pub queries: Vec<(u64, u8, u16)>,
    pub sets: Vec<(u64, u8, u16, Vec<u8>)>,
    pub uploads: Vec<(String, Vec<f64>)>,
    pub timers: Vec<u64>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, device_id: u64, service_index: u8, class: u32) -> Self {
        self.services.push((device_id, service_index, class));
        self
    }

    pub fn drop_device(&mut self, device_id: u64) {
        self.services.retain(|&(dev, _, _)| dev != device_id);
    }
}

impl Bus for MockBus {
    fn now(&self) -> u64 {
        self.now
    }

    fn find_service(&mut self, class: u32) -> Option<(u64, u8)> {
        self.services
            .iter()
            .find(|&&(_, _, c)| c == class)
            .map(|&(dev, idx, _)| (dev, idx))
    }

    fn cached_register(
        &mut self,
        device_id: u64,
        service_index: u8,
        code: u16,
        max_age_ms: u32,
    ) -> Option<Vec<u8>> {
        let key = (device_id, service_index, code);
        if max_age_ms != 0 {
            if let Some(&at) = self.register_times.get(&key) {
                if self.now.saturating_sub(at) > u64::from(max_age_ms) {
                    return None;
                }
            }
        }
        self.registers.get(&key).cloned()
    }

    fn query_register(&mut self, device_id: u64, service_index: u8, code: u16) {
        self.queries.push((device_id, service_index, code));
    }

    fn set_register(&mut self, device_id: u64, service_index: u8, code: u16, data: &[u8]) {
        self.sets.push((device_id, service_index, code, data.to_vec()));
    }

    fn cloud_upload(&mut self, label: &str, values: &[f64]) -> RuntimeResult<()> {
        self.uploads.push((label.to_string(), values.to_vec()));
        Ok(())
    }

    fn set_timer(&mut self, at: u64) {
        self.timers.push(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_kinds() {
        let ev = Packet::event(1, 2, 0x81, vec![]);
        assert_eq!(ev.event_code(), Some(0x81));
        assert_eq!(ev.register_code(), None);

        let rep = Packet::register_report(1, 2, 0x101, vec![0, 4, 0, 0]);
        assert_eq!(rep.register_code(), Some(0x101));
        assert_eq!(rep.event_code(), None);

        let gone = Packet::disconnected(1, 2);
        assert!(gone.is_disconnect());
        assert_eq!(gone.event_code(), None);
        assert_eq!(gone.register_code(), None);
    }

    #[test]
    fn mock_finds_first_service() {
        let mut bus = MockBus::new()
            .with_service(10, 1, 0x1473_a263)
            .with_service(11, 1, 0x1473_a263);
        assert_eq!(bus.find_service(0x1473_a263), Some((10, 1)));
        assert_eq!(bus.find_service(0x1421_bac7), None);
        bus.drop_device(10);
        assert_eq!(bus.find_service(0x1473_a263), Some((11, 1)));
    }
}
