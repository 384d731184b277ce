// MIT License - Copyright (c) 2026 Peter Wright
// Lares websocket wire protocol: frames, CRC, request builders

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{BridgeError, RejectReason, Result};

/// Suffix the panel appends to a request CMD for its reply.
pub const REPLY_SUFFIX: &str = "_RES";

/// Realtime push types registered after login.
pub const REALTIME_TYPES: &[&str] = &[
    "STATUS_OUTPUTS",
    "STATUS_BUS_HA_SENSORS",
    "STATUS_POWER_LINES",
    "STATUS_PARTITIONS",
    "STATUS_ZONES",
    "STATUS_SYSTEM",
    "STATUS_CONNECTION",
    "STATUS_TEMPERATURES",
    "STATUS_HUMIDITY",
];

/// Static configuration read after login.
pub const READ_TYPES: &[&str] = &[
    "OUTPUTS",
    "BUS_HAS",
    "SCENARIOS",
    "POWER_LINES",
    "PARTITIONS",
    "ZONES",
    "STATUS_SYSTEM",
    "CFG_SCHEDULER_TIMERS",
    "CFG_HOLIDAYS",
    "TEMPERATURES",
    "HUMIDITY",
    "CFG_THERMOSTATS",
    "CFG_ACCOUNTS",
];

const CRC_FIELD: &str = "\"CRC_16\"";
const CRC_PLACEHOLDER: &str = "0x0000";

/// One JSON message on the wire, in either direction.
///
/// Field order matters: `CRC_16` must serialize last because the checksum
/// covers everything before its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Frame {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub receiver: String,
    pub cmd: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub payload_type: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub crc_16: Option<String>,
    /// Arrival sequence number, stamped by the router
    #[serde(skip)]
    pub seq: u64,
}

// Panels are inconsistent about quoting ID and TIMESTAMP.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl Frame {
    /// Parse an inbound text frame, optionally verifying its CRC.
    pub fn parse(text: &str, verify_crc: bool) -> Result<Self> {
        let frame: Frame = serde_json::from_str(text).map_err(|e| BridgeError::Protocol {
            details: format!("malformed frame: {}", e),
        })?;
        if verify_crc && !is_valid_crc(text) {
            return Err(BridgeError::Protocol {
                details: format!("CRC mismatch on {} frame", frame.cmd),
            });
        }
        Ok(frame)
    }

    /// Serialize and stamp the CRC.
    pub fn encode(&self) -> Result<String> {
        let mut frame = self.clone();
        frame.crc_16 = Some(CRC_PLACEHOLDER.to_string());
        let text = serde_json::to_string(&frame)?;
        Ok(add_crc(&text))
    }

    /// Whether this frame is a reply (CMD ending in `_RES`).
    pub fn is_reply(&self) -> bool {
        self.cmd.ends_with(REPLY_SUFFIX)
    }

    /// Payload as an object, if it is one.
    pub fn payload_object(&self) -> Option<&Map<String, Value>> {
        self.payload.as_object()
    }
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Byte offset just past the opening quote of the CRC_16 value.
fn crc_value_start(text: &str) -> Option<usize> {
    let field = text.rfind(CRC_FIELD)?;
    let after = field + CRC_FIELD.len();
    let quote = text[after..].find('"')?;
    let between = &text[after..after + quote];
    if between.trim() != ":" {
        return None;
    }
    Some(after + quote + 1)
}

/// Replace the CRC_16 value in a serialized frame with the computed checksum.
///
/// The checksum covers the UTF-8 text up to and including `"CRC_16":"`.
pub fn add_crc(text: &str) -> String {
    let Some(start) = crc_value_start(text) else {
        return text.to_string();
    };
    let Some(len) = text[start..].find('"') else {
        return text.to_string();
    };
    let crc = crc16(&text.as_bytes()[..start]);
    format!("{}0x{:04x}{}", &text[..start], crc, &text[start + len..])
}

/// Check the CRC_16 value of an inbound frame.
pub fn is_valid_crc(text: &str) -> bool {
    let Some(start) = crc_value_start(text) else {
        return false;
    };
    let Some(len) = text[start..].find('"') else {
        return false;
    };
    let received = &text[start..start + len];
    let Some(hex) = received
        .strip_prefix("0x")
        .or_else(|| received.strip_prefix("0X"))
    else {
        return false;
    };
    match u16::from_str_radix(hex, 16) {
        Ok(value) => value == crc16(&text.as_bytes()[..start]),
        Err(_) => false,
    }
}

/// Partition arming modes understood by CMD_ARM_PARTITION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMode {
    /// Armed away (`A`, fallback `DA`)
    Away,
    /// Armed instant (`I`, fallback `IA`)
    Instant,
    /// Disarmed (`D`)
    Disarm,
}

impl PartitionMode {
    /// MOD values to try in order until the panel accepts one.
    pub fn candidates(&self) -> &'static [&'static str] {
        match self {
            PartitionMode::Away => &["A", "DA"],
            PartitionMode::Instant => &["I", "IA"],
            PartitionMode::Disarm => &["D"],
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" | "DA" | "AWAY" | "ARM" => Some(PartitionMode::Away),
            "I" | "IA" | "INSTANT" => Some(PartitionMode::Instant),
            "D" | "DISARM" => Some(PartitionMode::Disarm),
            _ => None,
        }
    }
}

/// Zone bypass commands understood by CMD_BYP_ZONE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassMode {
    On,
    Off,
    Toggle,
}

impl BypassMode {
    /// Newer web UIs use AUTO/NO rather than ON/OFF.
    pub fn wire_value(&self) -> &'static str {
        match self {
            BypassMode::On => "AUTO",
            BypassMode::Off => "NO",
            BypassMode::Toggle => "TGL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" | "AUTO" | "1" => Some(BypassMode::On),
            "OFF" | "NO" | "0" => Some(BypassMode::Off),
            "TGL" | "TOGGLE" => Some(BypassMode::Toggle),
            _ => None,
        }
    }
}

/// Output commands understood by CMD_SET_OUTPUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCommand {
    On,
    Off,
    /// Dimmer level 0-100
    Level(u8),
    Up,
    Down,
    /// Stop a moving roller
    Stop,
    /// Roller position 0-100
    Position(u8),
}

impl OutputCommand {
    pub fn wire_value(&self) -> String {
        match self {
            OutputCommand::On => "ON".to_string(),
            OutputCommand::Off => "OFF".to_string(),
            OutputCommand::Level(level) => (*level).min(100).to_string(),
            OutputCommand::Up => "UP".to_string(),
            OutputCommand::Down => "DOWN".to_string(),
            OutputCommand::Stop => "ALT".to_string(),
            OutputCommand::Position(pos) => (*pos).min(100).to_string(),
        }
    }
}

/// A request to the panel, before it is assigned an ID and stamped.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub cmd: String,
    pub payload_type: String,
    pub payload: Map<String, Value>,
}

impl Request {
    pub fn new(cmd: impl Into<String>, payload_type: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            payload_type: payload_type.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload field.
    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Reply CMD expected for this request.
    pub fn reply_kind(&self) -> String {
        format!("{}{}", self.cmd, REPLY_SUFFIX)
    }

    /// Scenario, partition and bypass commands must carry an explicit OK.
    pub fn is_security_command(&self) -> bool {
        self.cmd == "CMD_USR"
            && matches!(
                self.payload_type.as_str(),
                "CMD_EXE_SCENARIO" | "CMD_ARM_PARTITION" | "CMD_BYP_ZONE"
            )
    }

    /// Build the wire frame. `ID_LOGIN` is added for every command but LOGIN.
    pub fn to_frame(&self, sender: &str, id: &str, login_id: Option<&str>, timestamp: i64) -> Frame {
        let mut payload = self.payload.clone();
        if self.cmd != "LOGIN"
            && let Some(login_id) = login_id
        {
            payload.insert("ID_LOGIN".to_string(), Value::String(login_id.to_string()));
        }
        Frame {
            sender: sender.to_string(),
            receiver: String::new(),
            cmd: self.cmd.clone(),
            id: Some(id.to_string()),
            payload_type: Some(self.payload_type.clone()),
            payload: Value::Object(payload),
            timestamp: Some(timestamp.to_string()),
            crc_16: None,
            seq: 0,
        }
    }

    pub fn login(pin: &str) -> Self {
        Request::new("LOGIN", "USER").field("PIN", json!(pin))
    }

    pub fn realtime_register(types: &[&str]) -> Self {
        Request::new("REALTIME", "REGISTER").field("TYPES", json!(types))
    }

    pub fn read_multi(types: &[&str]) -> Self {
        Request::new("READ", "MULTI_TYPES")
            .field("ID_READ", json!("1"))
            .field("TYPES", json!(types))
    }

    pub fn read_thermostat_config(pin: Option<&str>) -> Self {
        let req = Request::new("READ", "CFG_THERMOSTATS").field("ID_READ", json!("1"));
        match pin {
            Some(pin) if !pin.is_empty() => req.field("PIN", json!(pin)),
            _ => req,
        }
    }

    pub fn system_version() -> Self {
        Request::new("SYSTEM_VERSION", "REQUEST")
    }

    pub fn last_logs(items: u32) -> Self {
        Request::new("LOGS", "GET_LAST_LOGS")
            .field("ID_LOG", json!("MAIN"))
            .field("ITEMS_LOG", json!(items.to_string()))
            .field("ITEMS_TYPE", json!(["ALL"]))
    }

    pub fn set_output(pin: &str, id: &str, command: &str) -> Self {
        Request::new("CMD_USR", "CMD_SET_OUTPUT")
            .field("PIN", json!(pin))
            .field("OUTPUT", json!({ "ID": id, "STA": command }))
    }

    pub fn execute_scenario(pin: &str, id: &str) -> Self {
        Request::new("CMD_USR", "CMD_EXE_SCENARIO")
            .field("PIN", json!(pin))
            .field("SCENARIO", json!({ "ID": id }))
    }

    pub fn arm_partition(pin: &str, id: &str, mode: &str) -> Self {
        Request::new("CMD_USR", "CMD_ARM_PARTITION")
            .field("PIN", json!(pin))
            .field("PARTITION", json!({ "ID": id, "MOD": mode }))
    }

    pub fn bypass_zone(pin: &str, id: &str, mode: BypassMode) -> Self {
        Request::new("CMD_USR", "CMD_BYP_ZONE")
            .field("PIN", json!(pin))
            .field("ZONE", json!({ "ID": id, "BYP": mode.wire_value() }))
    }

    /// WRITE_CFG with a typed payload, e.g. `CFG_SCHEDULER_TIMERS`.
    ///
    /// An empty payload type falls back to `CFG_ALL`.
    pub fn write_config(payload_type: &str, patch: Map<String, Value>, pin: Option<&str>) -> Self {
        let ptype = payload_type.trim().to_ascii_uppercase();
        let ptype = if ptype.is_empty() { "CFG_ALL".to_string() } else { ptype };
        let mut req = Request::new("WRITE_CFG", ptype);
        req.payload.extend(patch);
        match pin {
            Some(pin) if !pin.is_empty() => req.field("PIN", json!(pin)),
            _ => req,
        }
    }

    pub fn clear(payload_type: &str, pin: &str) -> Result<Self> {
        let ptype = payload_type.trim().to_ascii_uppercase();
        if ptype.is_empty() {
            return Err(BridgeError::InvalidArgument {
                details: "CLEAR requires a payload type".to_string(),
            });
        }
        Ok(Request::new("CLEAR", ptype).field("PIN", json!(pin)))
    }
}

/// Find the RESULT of a reply payload.
///
/// Looked up at the payload root, then inside the receiver object (keyed by
/// our sender name, or the first value), then in any nested object.
pub fn extract_result(payload: &Value, sender: &str) -> Option<String> {
    let obj = payload.as_object()?;
    if let Some(result) = obj.get("RESULT") {
        return Some(value_to_string(result));
    }
    let receiver = obj.get(sender).or_else(|| obj.values().next());
    if let Some(result) = receiver.and_then(|r| r.get("RESULT")) {
        return Some(value_to_string(result));
    }
    obj.values()
        .filter_map(|v| v.as_object())
        .find_map(|v| v.get("RESULT"))
        .map(value_to_string)
}

/// Decide whether a command reply means success.
///
/// A missing RESULT is accepted for ordinary commands and rejected for
/// security commands.
pub fn check_result(request: &Request, reply: &Frame, sender: &str) -> Result<()> {
    match extract_result(&reply.payload, sender) {
        Some(result) if result.trim().eq_ignore_ascii_case("OK") => Ok(()),
        Some(result) => Err(BridgeError::Rejected(RejectReason::Result(result))),
        None if request.is_security_command() => {
            Err(BridgeError::Rejected(RejectReason::MissingResult))
        }
        None => Ok(()),
    }
}

const SEASONS: [&str; 2] = ["WIN", "SUM"];
const SEASON_THRESHOLDS: [&str; 4] = ["T1", "T2", "T3", "TM"];
const SEASON_SCHEDULES: [&str; 9] = ["MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN", "SD1", "SD2"];

/// Compact `CFG_THERMOSTATS` entry for a write: `base` is the current
/// configuration, `patch` the caller's changes.
///
/// Day schedules are only sent when the patch carries them; the full
/// weekly table is too large for the panel to accept in one write.
pub fn thermostat_write_entry(
    id: &str,
    base: Option<&Map<String, Value>>,
    patch: &Map<String, Value>,
) -> Map<String, Value> {
    let pick = |key: &str| patch.get(key).or_else(|| base.and_then(|b| b.get(key)));
    let upper = |key: &str, default: &str| {
        pick(key)
            .map(value_to_string)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
            .to_ascii_uppercase()
    };

    let mut entry = Map::new();
    entry.insert("ID".to_string(), json!(id));
    entry.insert("ACT_MODE".to_string(), json!(upper("ACT_MODE", "OFF")));
    let season = upper("ACT_SEA", "WIN");
    let season = if SEASONS.contains(&season.as_str()) { season } else { "WIN".to_string() };
    entry.insert("ACT_SEA".to_string(), json!(season));

    if let Some(hours) = pick("MAN_HRS") {
        entry.insert("MAN_HRS".to_string(), hours.clone());
    }
    let tof = patch
        .get("TOF")
        .and_then(Value::as_object)
        .or_else(|| base.and_then(|b| b.get("TOF")).and_then(Value::as_object));
    if let Some(tof) = tof.filter(|t| !t.is_empty()) {
        entry.insert("TOF".to_string(), Value::Object(tof.clone()));
    }

    for key in SEASONS {
        let Some(changes) = patch.get(key).and_then(Value::as_object) else {
            continue;
        };
        let mut merged = base
            .and_then(|b| b.get(key))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        merged.extend(changes.clone());
        let compact: Map<String, Value> = merged
            .into_iter()
            .filter(|(k, _)| {
                SEASON_THRESHOLDS.contains(&k.as_str())
                    || (SEASON_SCHEDULES.contains(&k.as_str()) && changes.contains_key(k))
            })
            .collect();
        if !compact.is_empty() {
            entry.insert(key.to_string(), Value::Object(compact));
        }
    }

    for (key, value) in patch {
        let handled = matches!(key.as_str(), "ID" | "ACT_MODE" | "ACT_SEA" | "MAN_HRS" | "TOF")
            || SEASONS.contains(&key.as_str());
        if !handled {
            entry.insert(key.clone(), value.clone());
        }
    }
    entry
}

/// Render a JSON scalar the way the panel would have quoted it.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
