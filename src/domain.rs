// MIT License - Copyright (c) 2026 Peter Wright
// Entity domains, payload keys and identifier normalization

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::BridgeError;

/// A category of panel entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    Zones,
    Partitions,
    Outputs,
    Scenarios,
    Schedulers,
    Holidays,
    Thermostats,
    Systems,
    Connection,
    PowerLines,
    BusSensors,
    Accounts,
}

impl Domain {
    pub const ALL: [Domain; 12] = [
        Domain::Zones,
        Domain::Partitions,
        Domain::Outputs,
        Domain::Scenarios,
        Domain::Schedulers,
        Domain::Holidays,
        Domain::Thermostats,
        Domain::Systems,
        Domain::Connection,
        Domain::PowerLines,
        Domain::BusSensors,
        Domain::Accounts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Zones => "zones",
            Domain::Partitions => "partitions",
            Domain::Outputs => "outputs",
            Domain::Scenarios => "scenarios",
            Domain::Schedulers => "schedulers",
            Domain::Holidays => "holidays",
            Domain::Thermostats => "thermostats",
            Domain::Systems => "systems",
            Domain::Connection => "connection",
            Domain::PowerLines => "power_lines",
            Domain::BusSensors => "bus_sensors",
            Domain::Accounts => "accounts",
        }
    }

    /// Fields whose change counts as a genuine event.
    ///
    /// An empty slice means every field is meaningful.
    pub fn meaningful_fields(&self) -> &'static [&'static str] {
        match self {
            Domain::Zones => &["STA", "BYP", "T", "A", "FM", "VAS"],
            Domain::Partitions => &["ARM", "AST", "TST", "T"],
            Domain::Outputs => &["STA", "LEV", "POS"],
            Domain::Systems => &["ARM", "TEMP"],
            Domain::Schedulers => &["EN", "H", "M", "SCE"],
            Domain::Thermostats => &["TEMP", "HUM", "THERM", "ACT_MODE", "ACT_SEA", "MAN_HRS"],
            Domain::Accounts => &["DACC"],
            _ => &[],
        }
    }

    pub fn is_meaningful(&self, field: &str) -> bool {
        let fields = self.meaningful_fields();
        fields.is_empty() || fields.contains(&field)
    }

    /// Map a payload key (realtime `STATUS_*` or static read) to its domain.
    pub fn from_payload_key(key: &str) -> Option<Domain> {
        Some(match key {
            "STATUS_ZONES" | "ZONES" => Domain::Zones,
            "STATUS_PARTITIONS" | "PARTITIONS" => Domain::Partitions,
            "STATUS_OUTPUTS" | "OUTPUTS" => Domain::Outputs,
            "SCENARIOS" => Domain::Scenarios,
            "CFG_SCHEDULER_TIMERS" => Domain::Schedulers,
            "CFG_HOLIDAYS" => Domain::Holidays,
            "STATUS_TEMPERATURES" | "STATUS_HUMIDITY" | "TEMPERATURES" | "HUMIDITY"
            | "CFG_THERMOSTATS" => Domain::Thermostats,
            "STATUS_SYSTEM" => Domain::Systems,
            "STATUS_CONNECTION" => Domain::Connection,
            "STATUS_POWER_LINES" | "POWER_LINES" => Domain::PowerLines,
            "STATUS_BUS_HA_SENSORS" | "BUS_HAS" => Domain::BusSensors,
            "CFG_ACCOUNTS" => Domain::Accounts,
            _ => return None,
        })
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == wanted)
            .ok_or_else(|| BridgeError::InvalidDomain {
                name: s.to_string(),
            })
    }
}

/// Canonical form of an entity identifier.
///
/// Numeric ids lose their leading zeros ("007" and 7 both become "7", an
/// all-zero id becomes "0"); anything else is trimmed.
pub fn normalize_id(raw: &Value) -> Option<String> {
    let text = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    if text.bytes().all(|b| b.is_ascii_digit()) {
        let stripped = text.trim_start_matches('0');
        return Some(if stripped.is_empty() {
            "0".to_string()
        } else {
            stripped.to_string()
        });
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id(&json!("007")).as_deref(), Some("7"));
        assert_eq!(normalize_id(&json!(7)).as_deref(), Some("7"));
        assert_eq!(normalize_id(&json!("7")).as_deref(), Some("7"));
        assert_eq!(normalize_id(&json!("000")).as_deref(), Some("0"));
        assert_eq!(normalize_id(&json!(" A1 ")).as_deref(), Some("A1"));
        assert_eq!(normalize_id(&json!("")), None);
        assert_eq!(normalize_id(&json!(null)), None);
        assert_eq!(normalize_id(&json!({"x": 1})), None);
    }

    #[test]
    fn test_domain_round_trip_names() {
        for domain in Domain::ALL {
            assert_eq!(domain.as_str().parse::<Domain>().unwrap(), domain);
        }
        assert!("garage".parse::<Domain>().is_err());
    }

    #[test]
    fn test_payload_keys() {
        assert_eq!(Domain::from_payload_key("STATUS_ZONES"), Some(Domain::Zones));
        assert_eq!(Domain::from_payload_key("ZONES"), Some(Domain::Zones));
        assert_eq!(
            Domain::from_payload_key("STATUS_HUMIDITY"),
            Some(Domain::Thermostats)
        );
        assert_eq!(Domain::from_payload_key("RESULT"), None);
    }

    #[test]
    fn test_meaningful_fields() {
        assert!(Domain::Zones.is_meaningful("STA"));
        assert!(!Domain::Zones.is_meaningful("DES"));
        assert!(Domain::Connection.is_meaningful("anything"));
        assert!(Domain::Thermostats.is_meaningful("ACT_MODE"));
        assert!(!Domain::Thermostats.is_meaningful("DES"));
    }
}
