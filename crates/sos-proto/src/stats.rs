//! Reports sent by agents: periodic throughput samples and final termination counters
//!
//! Agents send these as JSON objects. Decoding is tolerant: a field that is
//! missing, empty or not a number defaults to zero and produces a
//! [`FieldWarning`], and keys we do not know are reported and skipped. Only a
//! payload that is not a JSON object, or that lacks a usable transfer id, is
//! rejected as a whole.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Which end of the transfer a report comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSide {
    Client,
    Server,
}

impl AgentSide {
    fn from_type_field(value: &str) -> Self {
        if value.eq_ignore_ascii_case("client") {
            AgentSide::Client
        } else {
            AgentSide::Server
        }
    }
}

impl fmt::Display for AgentSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentSide::Client => write!(f, "client"),
            AgentSide::Server => write!(f, "server"),
        }
    }
}

/// A (cumulative, rolling) throughput pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputTuple {
    pub cumulative: u64,
    pub rolling: u64,
}

impl ThroughputTuple {
    pub fn new(cumulative: u64, rolling: u64) -> Self {
        Self {
            cumulative,
            rolling,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cumulative == 0 && self.rolling == 0
    }
}

/// A field of a report that could not be taken at face value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWarning {
    pub field: String,
    pub message: String,
}

impl FieldWarning {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A decoded report together with everything that was off about it
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    pub value: T,
    pub warnings: Vec<FieldWarning>,
}

/// Reasons a report is rejected outright
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Report is not a JSON object")]
    NotAnObject,

    #[error("Report has no transfer_id")]
    MissingTransferId,

    #[error("Invalid transfer_id: {0}")]
    InvalidTransferId(String),
}

/// One periodic throughput report from an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub transfer_id: Uuid,
    pub side: AgentSide,
    /// Milliseconds since the Unix epoch
    pub collection_time: i64,
    pub overall: ThroughputTuple,
    pub per_socket: BTreeMap<u32, ThroughputTuple>,
}

impl TransferStats {
    pub fn new(transfer_id: Uuid, side: AgentSide, collection_time: i64) -> Self {
        Self {
            transfer_id,
            side,
            collection_time,
            overall: ThroughputTuple::default(),
            per_socket: BTreeMap::new(),
        }
    }

    pub fn is_client_side(&self) -> bool {
        self.side == AgentSide::Client
    }

    /// Fold a report for the same collection time into this one
    ///
    /// The aggregate is only replaced by a non-zero aggregate; per-socket
    /// samples are added, replacing older samples for the same socket.
    pub fn append(&mut self, other: &TransferStats) {
        if !other.overall.is_zero() {
            self.overall = other.overall;
        }
        self.per_socket
            .extend(other.per_socket.iter().map(|(id, tuple)| (*id, *tuple)));
    }

    pub fn from_slice(payload: &[u8]) -> Result<Decoded<Self>, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Decoded<Self>, DecodeError> {
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;
        let transfer_id = read_transfer_id(object)?;
        let mut warnings = Vec::new();

        let mut stats = TransferStats::new(transfer_id, AgentSide::Server, 0);
        let mut collection_time = None;

        for (key, value) in object {
            let key = key.to_ascii_lowercase();
            match key.as_str() {
                "transfer_id" => {}
                "type" | "agent_type" => {
                    stats.side = AgentSide::from_type_field(value.as_str().unwrap_or_default())
                }
                "collection_time" => {
                    collection_time = read_u64(value, &key, &mut warnings).map(|t| {
                        i64::try_from(t).unwrap_or_else(|_| {
                            warnings.push(FieldWarning::new(
                                key.as_str(),
                                format!("out of range: {}", t),
                            ));
                            0
                        })
                    })
                }
                "cumulative_throughput" => {
                    stats.overall.cumulative = read_u64(value, &key, &mut warnings).unwrap_or(0)
                }
                "rolling_throughput" => {
                    stats.overall.rolling = read_u64(value, &key, &mut warnings).unwrap_or(0)
                }
                "per_socket_throughput" => {
                    read_per_socket(value, &mut stats.per_socket, &mut warnings)
                }
                _ => warnings.push(FieldWarning::new(key.as_str(), "unknown key ignored")),
            }
        }

        stats.collection_time = collection_time.unwrap_or_else(|| Utc::now().timestamp_millis());

        Ok(Decoded {
            value: stats,
            warnings,
        })
    }
}

/// Final counters an agent sends when its half of a transfer is done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationStats {
    pub transfer_id: Uuid,
    pub side: AgentSide,
    pub overhead: u64,
    pub avg_sent_bytes: u64,
    pub std_sent_bytes: u64,
    pub avg_chunks: u64,
    pub std_chunks: u64,
}

impl TerminationStats {
    pub fn new(transfer_id: Uuid, side: AgentSide) -> Self {
        Self {
            transfer_id,
            side,
            overhead: 0,
            avg_sent_bytes: 0,
            std_sent_bytes: 0,
            avg_chunks: 0,
            std_chunks: 0,
        }
    }

    pub fn is_client_side(&self) -> bool {
        self.side == AgentSide::Client
    }

    /// Only the sending direction carries meaningful counters
    pub fn has_sent_data(&self) -> bool {
        self.avg_sent_bytes != 0
    }

    pub fn from_slice(payload: &[u8]) -> Result<Decoded<Self>, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Decoded<Self>, DecodeError> {
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;
        let transfer_id = read_transfer_id(object)?;
        let mut warnings = Vec::new();
        let mut stats = TerminationStats::new(transfer_id, AgentSide::Server);

        for (key, value) in object {
            let key = key.to_ascii_lowercase();
            let slot = match key.as_str() {
                "transfer_id" => continue,
                "type" | "agent_type" => {
                    stats.side = AgentSide::from_type_field(value.as_str().unwrap_or_default());
                    continue;
                }
                "overhead" => &mut stats.overhead,
                "avg_sent_bytes" => &mut stats.avg_sent_bytes,
                "std_sent_bytes" => &mut stats.std_sent_bytes,
                "avg_chunks" => &mut stats.avg_chunks,
                "std_chunks" => &mut stats.std_chunks,
                _ => {
                    warnings.push(FieldWarning::new(key.as_str(), "unknown key ignored"));
                    continue;
                }
            };
            *slot = read_u64(value, &key, &mut warnings).unwrap_or(0);
        }

        Ok(Decoded {
            value: stats,
            warnings,
        })
    }
}

/// Value of `name` in `object`, ignoring the case of the key
fn field<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    object.get(name).or_else(|| {
        object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

fn read_transfer_id(object: &Map<String, Value>) -> Result<Uuid, DecodeError> {
    let raw = field(object, "transfer_id")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingTransferId)?;
    Uuid::parse_str(raw.trim()).map_err(|_| DecodeError::InvalidTransferId(raw.to_string()))
}

/// Read an unsigned counter given as a JSON number or a numeric string
///
/// Returns `None` for an empty value; malformed values yield `Some(0)` plus a warning.
fn read_u64(value: &Value, field: &str, warnings: &mut Vec<FieldWarning>) -> Option<u64> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => match s.trim().parse::<u64>() {
            Ok(n) => Some(n),
            Err(_) => {
                warnings.push(FieldWarning::new(field, format!("not a number: {:?}", s)));
                Some(0)
            }
        },
        Value::Number(n) => match n.as_u64() {
            Some(n) => Some(n),
            None => {
                warnings.push(FieldWarning::new(field, format!("not a counter: {}", n)));
                Some(0)
            }
        },
        other => {
            warnings.push(FieldWarning::new(field, format!("unexpected value: {}", other)));
            Some(0)
        }
    }
}

fn read_per_socket(
    value: &Value,
    per_socket: &mut BTreeMap<u32, ThroughputTuple>,
    warnings: &mut Vec<FieldWarning>,
) {
    let Some(entries) = value.as_array() else {
        warnings.push(FieldWarning::new(
            "per_socket_throughput",
            "expected an array",
        ));
        return;
    };

    for entry in entries {
        let fields = entry.as_object();
        let get = |name: &str| fields.and_then(|f| field(f, name));
        let socket = get("socket_id").and_then(Value::as_u64);
        let cumulative = get("cumulative_throughput");
        let rolling = get("rolling_throughput");

        match (socket, cumulative, rolling) {
            (Some(socket), Some(cumulative), Some(rolling)) => {
                let Ok(socket) = u32::try_from(socket) else {
                    warnings.push(FieldWarning::new(
                        "per_socket_throughput",
                        format!("socket_id out of range: {}", socket),
                    ));
                    continue;
                };
                let cumulative = read_u64(cumulative, "cumulative_throughput", warnings);
                let rolling = read_u64(rolling, "rolling_throughput", warnings);
                per_socket.insert(
                    socket,
                    ThroughputTuple::new(cumulative.unwrap_or(0), rolling.unwrap_or(0)),
                );
            }
            _ => warnings.push(FieldWarning::new(
                "per_socket_throughput",
                format!("incomplete socket entry skipped: {}", entry),
            )),
        }
    }
}
