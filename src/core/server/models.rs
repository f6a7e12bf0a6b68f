//! Mock-server data model: register groups, per-address rules, fault
//! profiles.

use serde::{Deserialize, Serialize};

pub use crate::core::pdu::DataKind;

/// Logical grouping of sequential Modbus addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterGroup {
    pub name: String,
    pub kind: DataKind,
    pub start: u16,
    pub length: u16,
    pub writable: bool,
    #[serde(default)]
    pub description: String,
    /// Initial values (bits stored as 0/1); zero-filled when shorter than
    /// the group
    #[serde(default)]
    pub initial: Vec<u16>,
}

impl RegisterGroup {
    pub fn new(name: impl Into<String>, kind: DataKind, start: u16, length: u16) -> Self {
        Self {
            name: name.into(),
            kind,
            start,
            length,
            writable: kind.is_writable(),
            description: String::new(),
            initial: Vec::new(),
        }
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_initial(mut self, initial: Vec<u16>) -> Self {
        self.initial = initial;
        self
    }

    pub fn contains(&self, address: u16) -> bool {
        address >= self.start && (address as u32) < self.start as u32 + self.length as u32
    }

    /// Exclusive end address.
    pub fn end(&self) -> u32 {
        self.start as u32 + self.length as u32
    }

    pub fn overlaps(&self, other: &RegisterGroup) -> bool {
        self.kind == other.kind && (self.start as u32) < other.end() && (other.start as u32) < self.end()
    }
}

/// Policy override applied to one `(kind, address)` cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum RegisterRule {
    /// Reads return the forced value; writes are discarded
    FrozenValue { value: u16 },
    /// Reads see the store; writes are silently discarded
    IgnoreWrite,
    /// Any access answers with this Modbus exception
    Exception { code: u8 },
}

/// Runtime-configurable fault injection knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FaultProfile {
    /// Added before any response
    #[serde(default)]
    pub latency_ms: u32,
    /// Percent jitter applied to the latency
    #[serde(default)]
    pub latency_jitter_pct: f32,
    /// Probability in [0,1] that a request is silently discarded
    #[serde(default)]
    pub drop_rate: f32,
    /// Probability in [0,1] per outgoing payload byte of one flipped bit
    #[serde(default)]
    pub bit_flip_rate: f32,
    /// When set, every request answers with this exception
    #[serde(default)]
    pub forced_exception: Option<u8>,
}

impl FaultProfile {
    pub fn is_quiet(&self) -> bool {
        self.latency_ms == 0
            && self.drop_rate <= 0.0
            && self.bit_flip_rate <= 0.0
            && self.forced_exception.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_bounds() {
        let g = RegisterGroup::new("sensors", DataKind::Holding, 100, 10);
        assert!(g.contains(100));
        assert!(g.contains(109));
        assert!(!g.contains(110));
        assert!(!g.contains(99));
        assert!(g.writable);
        let i = RegisterGroup::new("ro", DataKind::Input, 0, 4);
        assert!(!i.writable);
    }

    #[test]
    fn test_group_overlap() {
        let a = RegisterGroup::new("a", DataKind::Holding, 0, 10);
        let b = RegisterGroup::new("b", DataKind::Holding, 9, 5);
        let c = RegisterGroup::new("c", DataKind::Holding, 10, 5);
        let d = RegisterGroup::new("d", DataKind::Input, 0, 10);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        // Different namespaces never overlap
        assert!(!a.overlaps(&d));
    }

    #[test]
    fn test_rule_serde() {
        let yaml = "mode: frozen-value\nvalue: 1234\n";
        let rule: RegisterRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule, RegisterRule::FrozenValue { value: 1234 });

        let yaml = "mode: exception\ncode: 2\n";
        let rule: RegisterRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule, RegisterRule::Exception { code: 2 });
    }

    #[test]
    fn test_fault_profile_quiet() {
        assert!(FaultProfile::default().is_quiet());
        assert!(!FaultProfile {
            drop_rate: 0.5,
            ..Default::default()
        }
        .is_quiet());
    }
}
