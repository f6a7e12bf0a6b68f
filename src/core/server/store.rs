//! Mock device register store
//!
//! Backing storage for the simulated device: register/bit vectors laid out
//! per group, per-address rules, and the state API the REPL/GUI drives.
//! Readers see consistent ranges (one lock spans a whole request's worth of
//! cells) and rule updates swap an `Arc` so an in-flight request keeps the
//! rule generation it started with.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::pdu::{DataKind, ExceptionCode};
use crate::core::script::RegisterAccess;
use crate::core::server::models::{RegisterGroup, RegisterRule};
use crate::utils::error::{Result, UmdtError};

/// Rules snapshot shared with in-flight requests.
pub type RuleMap = HashMap<(DataKind, u16), RegisterRule>;

#[derive(Debug, Default)]
struct Storage {
    registers: HashMap<DataKind, Vec<u16>>,
    bits: HashMap<DataKind, Vec<bool>>,
}

/// Full state dump returned by [`MockDevice::snapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// kind label -> (address, value) pairs in group order
    pub cells: HashMap<String, Vec<(u16, u16)>>,
    /// (kind label, address, rule)
    pub rules: Vec<(String, u16, RegisterRule)>,
}

/// In-memory Modbus slave storage with rules.
#[derive(Debug)]
pub struct MockDevice {
    groups: HashMap<DataKind, Vec<RegisterGroup>>,
    storage: Mutex<Storage>,
    rules: RwLock<Arc<RuleMap>>,
}

impl MockDevice {
    /// Build storage from groups; overlapping groups within one namespace
    /// are a configuration error.
    pub fn new(groups: Vec<RegisterGroup>, rules: RuleMap) -> Result<Arc<Self>> {
        for (i, a) in groups.iter().enumerate() {
            if a.end() > 0x1_0000 {
                return Err(UmdtError::config(
                    "<groups>",
                    format!("group '{}' exceeds address 65535", a.name),
                ));
            }
            for b in groups.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(UmdtError::config(
                        "<groups>",
                        format!(
                            "groups '{}' and '{}' overlap in the {} namespace",
                            a.name,
                            b.name,
                            a.kind.label()
                        ),
                    ));
                }
            }
        }

        let mut by_kind: HashMap<DataKind, Vec<RegisterGroup>> = HashMap::new();
        let mut storage = Storage::default();
        for group in groups {
            if group.kind.is_bit() {
                let store = storage.bits.entry(group.kind).or_default();
                for i in 0..group.length as usize {
                    store.push(group.initial.get(i).map(|&v| v != 0).unwrap_or(false));
                }
            } else {
                let store = storage.registers.entry(group.kind).or_default();
                for i in 0..group.length as usize {
                    store.push(group.initial.get(i).copied().unwrap_or(0));
                }
            }
            by_kind.entry(group.kind).or_default().push(group);
        }

        Ok(Arc::new(Self {
            groups: by_kind,
            storage: Mutex::new(storage),
            rules: RwLock::new(Arc::new(rules)),
        }))
    }

    /// Groups configured for a namespace.
    pub fn groups_for(&self, kind: DataKind) -> &[RegisterGroup] {
        self.groups.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Storage index for an address, or the group it falls outside of.
    fn resolve_index(&self, kind: DataKind, address: u16) -> Option<(usize, bool)> {
        let groups = self.groups.get(&kind)?;
        let mut offset = 0usize;
        for group in groups {
            if group.contains(address) {
                return Some((offset + (address - group.start) as usize, group.writable));
            }
            offset += group.length as usize;
        }
        None
    }

    /// Current rules generation. Dispatch clones this once per request.
    pub fn rules_snapshot(&self) -> Arc<RuleMap> {
        Arc::clone(&self.rules.read())
    }

    /// Install a rule (atomic swap).
    pub fn add_rule(&self, kind: DataKind, address: u16, rule: RegisterRule) {
        let mut current = self.rules.write();
        let mut next = (**current).clone();
        next.insert((kind, address), rule);
        *current = Arc::new(next);
    }

    /// Remove a rule; true when one existed.
    pub fn remove_rule(&self, kind: DataKind, address: u16) -> bool {
        let mut current = self.rules.write();
        if !current.contains_key(&(kind, address)) {
            return false;
        }
        let mut next = (**current).clone();
        next.remove(&(kind, address));
        *current = Arc::new(next);
        true
    }

    // ========================================================================
    // Request-path access (rules applied)
    // ========================================================================

    /// Read `count` cells under a rules generation. Bits come back as 0/1.
    pub async fn read_range(
        &self,
        kind: DataKind,
        address: u16,
        count: u16,
        rules: &RuleMap,
    ) -> Result<Vec<u16>> {
        let storage = self.storage.lock().await;
        let mut out = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let absolute = address
                .checked_add(offset)
                .ok_or(UmdtError::Exception(ExceptionCode::IllegalDataAddress as u8))?;
            let (index, _) = self
                .resolve_index(kind, absolute)
                .ok_or(UmdtError::Exception(ExceptionCode::IllegalDataAddress as u8))?;

            let mut value = if kind.is_bit() {
                u16::from(storage.bits[&kind][index])
            } else {
                storage.registers[&kind][index]
            };

            match rules.get(&(kind, absolute)) {
                Some(RegisterRule::Exception { code }) => {
                    return Err(UmdtError::Exception(*code));
                }
                Some(RegisterRule::FrozenValue { value: forced }) => value = *forced,
                _ => {}
            }
            out.push(value);
        }
        Ok(out)
    }

    /// Write cells under a rules generation. Frozen/ignore rules suppress
    /// the store update but still report success; exception rules and
    /// unmapped or read-only ranges fail.
    pub async fn write_range(
        &self,
        kind: DataKind,
        address: u16,
        values: &[u16],
        enforce_writable: bool,
        rules: &RuleMap,
    ) -> Result<()> {
        let mut storage = self.storage.lock().await;
        // Validate the whole range before mutating anything, so a failed
        // write never half-applies.
        let mut indices = Vec::with_capacity(values.len());
        for offset in 0..values.len() {
            let absolute = address
                .checked_add(offset as u16)
                .ok_or(UmdtError::Exception(ExceptionCode::IllegalDataAddress as u8))?;
            let (index, writable) = self
                .resolve_index(kind, absolute)
                .ok_or(UmdtError::Exception(ExceptionCode::IllegalDataAddress as u8))?;
            if enforce_writable && !writable {
                return Err(UmdtError::Exception(ExceptionCode::IllegalDataAddress as u8));
            }
            if let Some(RegisterRule::Exception { code }) = rules.get(&(kind, absolute)) {
                return Err(UmdtError::Exception(*code));
            }
            indices.push((absolute, index));
        }

        for ((absolute, index), &value) in indices.into_iter().zip(values) {
            match rules.get(&(kind, absolute)) {
                Some(RegisterRule::FrozenValue { .. }) | Some(RegisterRule::IgnoreWrite) => {
                    continue;
                }
                _ => {}
            }
            if kind.is_bit() {
                if let Some(store) = storage.bits.get_mut(&kind) {
                    store[index] = value != 0;
                }
            } else if let Some(store) = storage.registers.get_mut(&kind) {
                store[index] = value;
            }
        }
        Ok(())
    }

    // ========================================================================
    // State API (REPL/GUI/scripts; rules bypassed)
    // ========================================================================

    /// Read one cell as stored, ignoring rules.
    pub async fn get(&self, kind: DataKind, address: u16) -> Result<u16> {
        let storage = self.storage.lock().await;
        let (index, _) = self
            .resolve_index(kind, address)
            .ok_or_else(|| UmdtError::invalid(format!("address {address} is not mapped")))?;
        Ok(if kind.is_bit() {
            u16::from(storage.bits[&kind][index])
        } else {
            storage.registers[&kind][index]
        })
    }

    /// Set one cell directly, ignoring rules and writability.
    pub async fn set(&self, kind: DataKind, address: u16, value: u16) -> Result<()> {
        let mut storage = self.storage.lock().await;
        let (index, _) = self
            .resolve_index(kind, address)
            .ok_or_else(|| UmdtError::invalid(format!("address {address} is not mapped")))?;
        if kind.is_bit() {
            if let Some(store) = storage.bits.get_mut(&kind) {
                store[index] = value != 0;
            }
        } else if let Some(store) = storage.registers.get_mut(&kind) {
            store[index] = value;
        }
        Ok(())
    }

    /// Full dump of every mapped cell plus the active rules.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let storage = self.storage.lock().await;
        let mut cells: HashMap<String, Vec<(u16, u16)>> = HashMap::new();
        for (kind, groups) in &self.groups {
            let mut entries = Vec::new();
            let mut offset = 0usize;
            for group in groups {
                for i in 0..group.length as usize {
                    let value = if kind.is_bit() {
                        u16::from(storage.bits[kind][offset + i])
                    } else {
                        storage.registers[kind][offset + i]
                    };
                    entries.push((group.start + i as u16, value));
                }
                offset += group.length as usize;
            }
            cells.insert(kind.label().to_string(), entries);
        }

        let rules = self
            .rules_snapshot()
            .iter()
            .map(|(&(kind, address), &rule)| (kind.label().to_string(), address, rule))
            .collect();

        StoreSnapshot { cells, rules }
    }
}

#[async_trait]
impl RegisterAccess for MockDevice {
    async fn read_one(&self, kind: DataKind, address: u16) -> Result<u16> {
        self.get(kind, address).await
    }

    async fn write_one(&self, kind: DataKind, address: u16, value: u16) -> Result<()> {
        self.set(kind, address, value).await
    }
}
