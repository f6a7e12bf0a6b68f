//! Mock-server configuration loading
//!
//! YAML and JSON are equivalent; the file extension picks the parser.
//! Loading is idempotent: the same file always produces the same in-memory
//! state. Validation failures (unknown data types, overlapping groups,
//! rule/mode field mismatches) are `Config` errors naming the file.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::pdu::DataKind;
use crate::core::server::models::{FaultProfile, RegisterGroup, RegisterRule};
use crate::core::server::store::RuleMap;
use crate::utils::error::{Result, UmdtError};

/// `groups[].initial` entries: registers or booleans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialValue {
    Bool(bool),
    Number(u16),
}

impl InitialValue {
    fn as_u16(&self) -> u16 {
        match self {
            InitialValue::Bool(b) => u16::from(*b),
            InitialValue::Number(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupFile {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    start: u16,
    length: u16,
    /// Defaults to true for holding/coil, false for input/discrete
    writable: Option<bool>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    initial: Vec<InitialValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleFile {
    mode: String,
    /// Namespace; defaults to holding
    #[serde(rename = "type")]
    kind: Option<String>,
    forced_value: Option<u16>,
    exception_code: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScriptFile {
    path: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_unit_id() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default = "default_unit_id")]
    unit_id: u8,
    #[serde(default)]
    groups: Vec<GroupFile>,
    /// Keyed by decimal address string
    #[serde(default)]
    rules: HashMap<String, RuleFile>,
    #[serde(default)]
    faults: Option<FaultProfile>,
    #[serde(default)]
    scripts: Vec<ScriptFile>,
    #[serde(default)]
    random_seed: Option<u64>,
}

/// Enabled script reference from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRef {
    pub path: String,
}

/// Parsed and validated server configuration.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    pub device_name: String,
    pub unit_id: u8,
    pub groups: Vec<RegisterGroup>,
    pub rules: RuleMap,
    pub faults: FaultProfile,
    pub scripts: Vec<ScriptRef>,
    pub random_seed: Option<u64>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            device_name: "umdt-mock".to_string(),
            unit_id: 1,
            groups: Vec::new(),
            rules: RuleMap::new(),
            faults: FaultProfile::default(),
            scripts: Vec::new(),
            random_seed: None,
        }
    }
}

impl MockServerConfig {
    pub fn with_groups(groups: Vec<RegisterGroup>) -> Self {
        Self {
            groups,
            ..Default::default()
        }
    }

    /// Load from a YAML (`.yaml`/`.yml`) or JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|e| UmdtError::config(&display, format!("cannot read file: {e}")))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let file: ConfigFile = if is_yaml {
            serde_yaml::from_str(&text)
                .map_err(|e| UmdtError::config(&display, format!("YAML error: {e}")))?
        } else {
            serde_json::from_str(&text)
                .map_err(|e| UmdtError::config(&display, format!("JSON error: {e}")))?
        };

        Self::from_file(file, &display)
    }

    /// Parse a YAML document directly (tests, embedded configs).
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(text)
            .map_err(|e| UmdtError::config("<inline>", format!("YAML error: {e}")))?;
        Self::from_file(file, "<inline>")
    }

    fn from_file(file: ConfigFile, source: &str) -> Result<Self> {
        let mut groups = Vec::with_capacity(file.groups.len());
        for g in &file.groups {
            let kind = DataKind::parse(&g.kind)
                .map_err(|e| UmdtError::config(source, e.to_string()))?;
            if g.length == 0 {
                return Err(UmdtError::config(
                    source,
                    format!("group '{}' has zero length", g.name),
                ));
            }
            if g.initial.len() > g.length as usize {
                return Err(UmdtError::config(
                    source,
                    format!(
                        "group '{}' has {} initial values for length {}",
                        g.name,
                        g.initial.len(),
                        g.length
                    ),
                ));
            }
            let mut group = RegisterGroup::new(g.name.clone(), kind, g.start, g.length)
                .with_initial(g.initial.iter().map(InitialValue::as_u16).collect());
            group.writable = g.writable.unwrap_or(kind.is_writable());
            group.description = g.description.clone();
            groups.push(group);
        }

        // Overlap validation happens again in MockDevice::new; doing it here
        // makes load_config fail before any state is touched.
        for (i, a) in groups.iter().enumerate() {
            for b in groups.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(UmdtError::config(
                        source,
                        format!("groups '{}' and '{}' overlap", a.name, b.name),
                    ));
                }
            }
        }

        let mut rules = RuleMap::new();
        for (address_text, rule) in &file.rules {
            let address: u16 = address_text.trim().parse().map_err(|_| {
                UmdtError::config(source, format!("rule key '{address_text}' is not an address"))
            })?;
            let kind = match &rule.kind {
                Some(text) => DataKind::parse(text)
                    .map_err(|e| UmdtError::config(source, e.to_string()))?,
                None => DataKind::Holding,
            };
            let parsed = match rule.mode.as_str() {
                "frozen-value" => {
                    let value = rule.forced_value.ok_or_else(|| {
                        UmdtError::config(
                            source,
                            format!("rule {address}: frozen-value requires forced_value"),
                        )
                    })?;
                    RegisterRule::FrozenValue { value }
                }
                "ignore-write" => RegisterRule::IgnoreWrite,
                "exception" => {
                    let code = rule.exception_code.ok_or_else(|| {
                        UmdtError::config(
                            source,
                            format!("rule {address}: exception requires exception_code"),
                        )
                    })?;
                    RegisterRule::Exception { code }
                }
                other => {
                    return Err(UmdtError::config(
                        source,
                        format!("rule {address}: unknown mode '{other}'"),
                    ))
                }
            };
            rules.insert((kind, address), parsed);
        }

        let scripts = file
            .scripts
            .iter()
            .filter(|s| s.enabled)
            .map(|s| ScriptRef {
                path: s.path.clone(),
            })
            .collect();

        Ok(Self {
            device_name: file
                .device_name
                .unwrap_or_else(|| "umdt-mock".to_string()),
            unit_id: file.unit_id,
            groups,
            rules,
            faults: file.faults.unwrap_or_default(),
            scripts,
            random_seed: file.random_seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
device_name: boiler-sim
unit_id: 3
groups:
  - name: sensors
    type: holding
    start: 100
    length: 8
    initial: [10, 20, 30]
  - name: status
    type: coil
    start: 0
    length: 4
    initial: [true, false, true]
  - name: raw
    type: input
    start: 0
    length: 2
rules:
  "101":
    mode: frozen-value
    forced_value: 1234
  "102":
    mode: ignore-write
  "103":
    mode: exception
    exception_code: 2
faults:
  latency_ms: 50
  drop_rate: 0.25
  bit_flip_rate: 0.0
scripts:
  - path: counter.rs
    enabled: true
  - path: disabled.rs
    enabled: false
"#;

    #[test]
    fn test_full_parse() {
        let config = MockServerConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.device_name, "boiler-sim");
        assert_eq!(config.unit_id, 3);
        assert_eq!(config.groups.len(), 3);
        assert_eq!(config.groups[0].initial, vec![10, 20, 30]);
        assert_eq!(config.groups[1].initial, vec![1, 0, 1]);
        // writable defaults: holding yes, input no
        assert!(config.groups[0].writable);
        assert!(!config.groups[2].writable);

        assert_eq!(
            config.rules.get(&(DataKind::Holding, 101)),
            Some(&RegisterRule::FrozenValue { value: 1234 })
        );
        assert_eq!(
            config.rules.get(&(DataKind::Holding, 103)),
            Some(&RegisterRule::Exception { code: 2 })
        );
        assert_eq!(config.faults.latency_ms, 50);
        assert_eq!(config.scripts, vec![ScriptRef { path: "counter.rs".into() }]);
    }

    #[test]
    fn test_idempotent_load() {
        let a = MockServerConfig::from_yaml_str(SAMPLE).unwrap();
        let b = MockServerConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(a.groups, b.groups);
        assert_eq!(a.rules, b.rules);
        assert_eq!(a.faults, b.faults);
    }

    #[test]
    fn test_json_equivalent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(
            &path,
            r#"{"unit_id": 2, "groups": [{"name": "g", "type": "holding", "start": 0, "length": 4}]}"#,
        )
        .unwrap();
        let config = MockServerConfig::load(&path).unwrap();
        assert_eq!(config.unit_id, 2);
        assert_eq!(config.groups.len(), 1);
    }

    #[test]
    fn test_bad_configs_fail() {
        assert!(MockServerConfig::from_yaml_str(
            "groups:\n  - name: g\n    type: imaginary\n    start: 0\n    length: 4\n"
        )
        .is_err());

        assert!(MockServerConfig::from_yaml_str(
            "rules:\n  \"5\":\n    mode: frozen-value\n"
        )
        .is_err());

        assert!(MockServerConfig::from_yaml_str(
            "rules:\n  \"not-an-address\":\n    mode: ignore-write\n"
        )
        .is_err());

        let overlapping = r#"
groups:
  - name: a
    type: holding
    start: 0
    length: 10
  - name: b
    type: holding
    start: 5
    length: 10
"#;
        assert!(MockServerConfig::from_yaml_str(overlapping).is_err());
    }
}
