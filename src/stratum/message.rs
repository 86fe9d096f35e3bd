//! Stratum protocol message definitions
//!
//! Line-delimited JSON-RPC: requests carry `id`, `method` and `params`,
//! responses carry `id` and either `result` or `error`.

use crate::work::{Job, Work};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stratum protocol methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumMethod {
    /// Client subscribes to mining notifications
    Subscribe,
    /// Client authorizes with credentials
    Authorize,
    /// Client submits a share
    Submit,
    /// Server notifies client of new work
    Notify,
    /// Server sets the difficulty of the next job
    SetDifficulty,
    /// Server asks the client to reconnect
    Reconnect,
    /// Server asks for the client version
    GetVersion,
    /// Server message for the operator
    ShowMessage,
    /// Unknown method
    Unknown(String),
}

impl StratumMethod {
    /// Parse method from string
    pub fn parse_method(s: &str) -> Self {
        match s {
            "mining.subscribe" => Self::Subscribe,
            "mining.authorize" => Self::Authorize,
            "mining.submit" => Self::Submit,
            "mining.notify" => Self::Notify,
            "mining.set_difficulty" => Self::SetDifficulty,
            "client.reconnect" => Self::Reconnect,
            "client.get_version" => Self::GetVersion,
            "client.show_message" => Self::ShowMessage,
            _ => Self::Unknown(s.to_string()),
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::Subscribe => "mining.subscribe",
            Self::Authorize => "mining.authorize",
            Self::Submit => "mining.submit",
            Self::Notify => "mining.notify",
            Self::SetDifficulty => "mining.set_difficulty",
            Self::Reconnect => "client.reconnect",
            Self::GetVersion => "client.get_version",
            Self::ShowMessage => "client.show_message",
            Self::Unknown(s) => s,
        }
    }
}

/// Stratum request message (client requests and server commands)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    /// Request ID, null for notifications
    #[serde(default)]
    pub id: Value,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Vec<Value>,
}

impl StratumRequest {
    /// Create a new request
    pub fn new(id: impl Into<Value>, method: StratumMethod, params: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.as_str().to_string(),
            params,
        }
    }

    /// Get the method as enum
    pub fn method_enum(&self) -> StratumMethod {
        StratumMethod::parse_method(&self.method)
    }

    /// Serialize as one wire line (without the newline)
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Stratum response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    /// Request ID this responds to
    #[serde(default)]
    pub id: Value,
    /// Result if successful
    #[serde(default)]
    pub result: Option<Value>,
    /// Error if failed
    #[serde(default)]
    pub error: Option<Value>,
}

impl StratumResponse {
    /// Create a successful response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Whether the pool accepted the request
    pub fn is_accepted(&self) -> bool {
        self.error.as_ref().map_or(true, Value::is_null)
            && self.result.as_ref().map_or(false, |r| r.as_bool() != Some(false) && !r.is_null())
    }

    /// Serialize as one wire line (without the newline)
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Generic Stratum message
#[derive(Debug, Clone)]
pub enum StratumMessage {
    /// Command or notification carrying a method
    Request(StratumRequest),
    /// Response to one of our requests
    Response(StratumResponse),
}

impl StratumMessage {
    /// Parse a JSON line into a Stratum message
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;

        if value.get("method").is_some() {
            Ok(StratumMessage::Request(serde_json::from_value(value)?))
        } else {
            Ok(StratumMessage::Response(serde_json::from_value(value)?))
        }
    }
}

/// Session parameters returned by `mining.subscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub session_id: String,
    pub xnonce1: Vec<u8>,
    pub xnonce2_size: usize,
}

/// Largest extranonce2 a pool may ask for
pub const MAX_XNONCE2_SIZE: i64 = 100;

/// Parse the `result` of a subscribe response:
/// `[subscription details, extranonce1 hex, extranonce2 size]`
pub fn parse_subscribe_result(response: &StratumResponse) -> Result<Subscription> {
    let result = match (&response.result, &response.error) {
        (Some(result), _) if !result.is_null() => result,
        (_, Some(error)) if !error.is_null() => {
            return Err(Error::stratum(format!("subscribe error: {}", error)))
        }
        _ => return Err(Error::stratum("unknown subscribe error")),
    };

    let items = result
        .as_array()
        .ok_or_else(|| Error::stratum("subscribe result is not an array"))?;
    if items.len() < 3 {
        return Err(Error::stratum("not enough values in subscribe result"));
    }

    let session_id = find_session_id(items)
        .ok_or_else(|| Error::stratum("failed to find the session id"))?;

    let xnonce1 = items[1]
        .as_str()
        .ok_or_else(|| Error::stratum("invalid extranonce1"))?;
    let xnonce1 = hex::decode(xnonce1)?;

    let xnonce2_size = items[2]
        .as_i64()
        .ok_or_else(|| Error::stratum("cannot parse extranonce2 size"))?;
    if !(0..=MAX_XNONCE2_SIZE).contains(&xnonce2_size) {
        return Err(Error::stratum(format!(
            "invalid extranonce2 size {}",
            xnonce2_size
        )));
    }

    Ok(Subscription {
        session_id,
        xnonce1,
        xnonce2_size: xnonce2_size as usize,
    })
}

/// Locate the session id in a subscribe result
///
/// Pools send it as the element right after a literal `"mining.notify"`
/// somewhere in the result's arrays, possibly nested as
/// `[["mining.set_difficulty", id], ["mining.notify", id]]`; there is no
/// named field. Arrays are searched depth first.
pub fn find_session_id(items: &[Value]) -> Option<String> {
    items
        .iter()
        .filter_map(Value::as_array)
        .find_map(|array| session_id_in(array))
}

fn session_id_in(array: &[Value]) -> Option<String> {
    let mut notify_found = false;
    for item in array {
        if let Value::Array(nested) = item {
            if let Some(id) = session_id_in(nested) {
                return Some(id);
            }
            continue;
        }
        let s = scalar_string(item);
        if notify_found {
            return Some(s);
        }
        if s == "mining.notify" {
            notify_found = true;
        }
    }
    None
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Number of positional params in `mining.notify`
pub const NOTIFY_PARAMS: usize = 10;

/// Build a job from `mining.notify` params:
/// `[job_id, prevhash, coinbase1, coinbase2, merkle[], version, nbits, edgebits, time, clean]`
pub fn parse_notify(
    params: &[Value],
    xnonce1: &[u8],
    xnonce2_size: usize,
    diff: f64,
) -> Result<Job> {
    if params.len() < NOTIFY_PARAMS {
        return Err(Error::protocol(format!(
            "mining.notify needs {} params, got {}",
            NOTIFY_PARAMS,
            params.len()
        )));
    }

    let id = match &params[0] {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return Err(Error::protocol("mining.notify has no job id")),
    };

    let prevhash: [u8; 32] = hex_field(&params[1], "prevhash")?;
    let coinbase1 = hex_bytes(&params[2], "coinbase1")?;
    let coinbase2 = hex_bytes(&params[3], "coinbase2")?;

    let merkle = params[4]
        .as_array()
        .ok_or_else(|| Error::protocol("merkle branches are not an array"))?
        .iter()
        .map(|branch| hex_field::<32>(branch, "merkle branch"))
        .collect::<Result<Vec<_>>>()?;

    let version: [u8; 4] = hex_field(&params[5], "version")?;
    let nbits: [u8; 4] = hex_field(&params[6], "nbits")?;
    let edge_bits = parse_edge_bits(&params[7])?;
    let time: [u8; 4] = hex_field(&params[8], "time")?;
    let clean = params[9].as_bool().unwrap_or(false);

    let xnonce2_start = coinbase1.len() + xnonce1.len();
    let mut coinbase =
        Vec::with_capacity(xnonce2_start + xnonce2_size + coinbase2.len());
    coinbase.extend_from_slice(&coinbase1);
    coinbase.extend_from_slice(xnonce1);
    coinbase.resize(xnonce2_start + xnonce2_size, 0);
    coinbase.extend_from_slice(&coinbase2);

    Ok(Job {
        id,
        prevhash,
        coinbase,
        xnonce2_start,
        xnonce2_size,
        merkle,
        version,
        nbits,
        time,
        edge_bits,
        clean,
        diff,
    })
}

/// Parse `mining.set_difficulty` params; zero and negative values are rejected
pub fn parse_difficulty(params: &[Value]) -> Result<f64> {
    let diff = match params.first() {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::protocol("mining.set_difficulty carries no number"))?;

    if !diff.is_finite() || diff <= 0.0 {
        return Err(Error::protocol(format!("rejected difficulty {}", diff)));
    }
    Ok(diff)
}

/// Target of a `client.reconnect`: host, port and an optional wait
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconnectTarget {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub wait_secs: u64,
}

/// Parse `client.reconnect` params `[host, port, wait]`, all optional
pub fn parse_reconnect(params: &[Value]) -> ReconnectTarget {
    let host = params
        .first()
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())
        .map(str::to_string);
    let port = params.get(1).and_then(|p| match p {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });
    let wait_secs = params.get(2).and_then(Value::as_u64).unwrap_or(0);

    ReconnectTarget {
        host,
        port,
        wait_secs,
    }
}

/// Params of `mining.submit` for a solved work
pub fn submit_params(user: &str, work: &Work) -> Vec<Value> {
    vec![
        Value::from(user),
        Value::from(work.job_id.as_str()),
        Value::from(hex::encode(&work.xnonce2)),
        Value::from(crate::work::word_to_hex(work.time())),
        Value::from(crate::work::word_to_hex(work.nonce())),
        Value::from(work.cycle().to_string()),
    ]
}

fn parse_edge_bits(value: &Value) -> Result<u8> {
    let bits = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::protocol("edge bits are not a number"))?;

    u8::try_from(bits)
        .ok()
        .filter(|b| *b > 0)
        .ok_or_else(|| Error::protocol(format!("edge bits out of range: {}", bits)))
}

fn hex_bytes(value: &Value, field: &str) -> Result<Vec<u8>> {
    let s = value
        .as_str()
        .ok_or_else(|| Error::protocol(format!("{} is not a string", field)))?;
    hex::decode(s).map_err(|e| Error::protocol(format!("{} is not hex: {}", field, e)))
}

fn hex_field<const N: usize>(value: &Value, field: &str) -> Result<[u8; N]> {
    let bytes = hex_bytes(value, field)?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        Error::protocol(format!(
            "{} must be {} bytes, got {}",
            field,
            N,
            bytes.len()
        ))
    })
}
