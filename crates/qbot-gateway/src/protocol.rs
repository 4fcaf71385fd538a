//! Gateway wire format: op-coded frames, inbound classification, and the
//! outbound identify/heartbeat builders.
//!
//! Only the opcodes the bot needs are modelled; dispatch payloads are
//! forwarded as opaque `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use qbot_core::{Error, Result};

/// Gateway opcodes.
pub mod opcode {
    /// Event dispatch (receive only).
    pub const DISPATCH: u8 = 0;
    /// Heartbeat (send only).
    pub const HEARTBEAT: u8 = 1;
    /// Identify (send only).
    pub const IDENTIFY: u8 = 2;
    /// Hello — carries the heartbeat interval (receive only).
    pub const HELLO: u8 = 10;
    /// Heartbeat acknowledgement (receive only).
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes worth naming.
pub mod close_code {
    /// Authentication failed — bad token.
    pub const BAD_AUTH: u16 = 4004;
}

/// Raw frame as sent/received over the connection.
///
/// Heartbeats serialize `d` as an explicit `null`, so `d` is never skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Value>,
    /// Event name, only on dispatch frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelloPayload {
    heartbeat_interval: u64,
}

/// Inbound frame classification.
///
/// A closed set: new frame kinds are added here, never by subclassing a
/// frame base. Unknown opcodes are carried through so the session can log
/// and skip them.
#[derive(Debug)]
pub enum Frame {
    Hello { heartbeat_interval_ms: u64 },
    Dispatch { event: String, data: Value },
    HeartbeatAck,
    Unknown(u8),
}

impl Frame {
    /// Classify a raw inbound frame.
    ///
    /// Fails with [`Error::Protocol`] when a known opcode is missing its
    /// required payload; the session logs that and keeps the connection.
    pub fn classify(raw: GatewayFrame) -> Result<Frame> {
        match raw.op {
            opcode::HELLO => {
                let d = raw
                    .d
                    .ok_or_else(|| Error::Protocol("hello frame without payload".to_string()))?;
                let hello: HelloPayload = serde_json::from_value(d)
                    .map_err(|e| Error::Protocol(format!("bad hello payload: {e}")))?;
                Ok(Frame::Hello {
                    heartbeat_interval_ms: hello.heartbeat_interval,
                })
            }
            opcode::DISPATCH => {
                let event = raw.t.ok_or_else(|| {
                    Error::Protocol("dispatch frame without event name".to_string())
                })?;
                Ok(Frame::Dispatch {
                    event,
                    data: raw.d.unwrap_or(Value::Null),
                })
            }
            opcode::HEARTBEAT_ACK => Ok(Frame::HeartbeatAck),
            other => Ok(Frame::Unknown(other)),
        }
    }
}

/// Build an identify frame (`op=2`) from the current credential and the
/// configured capability bitmask, shard pair, and client metadata.
pub fn build_identify(
    token: &str,
    intents: u32,
    shard: [u32; 2],
    properties: &Value,
) -> GatewayFrame {
    GatewayFrame {
        op: opcode::IDENTIFY,
        d: Some(serde_json::json!({
            "token": format!("QQBot {token}"),
            "intents": intents,
            "shard": shard,
            "properties": properties,
        })),
        t: None,
    }
}

/// Build a heartbeat frame (`{op:1, d:null}`).
pub fn build_heartbeat() -> GatewayFrame {
    GatewayFrame {
        op: opcode::HEARTBEAT,
        d: None,
        t: None,
    }
}
