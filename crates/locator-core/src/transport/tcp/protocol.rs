//! Peer protocol types and framing.
//!
//! Peers exchange JSON-RPC 2.0 objects, one per frame, behind a big-endian
//! `u32` length.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Methods:
//!
//! | method             | params                         | result                 |
//! |--------------------|--------------------------------|------------------------|
//! | `ping`             | `{}`                           | `"pong"`               |
//! | `peer.hello`       | [`HelloParams`]                | [`HelloReply`]         |
//! | `replica.apply`    | wire mutation                  | `{"applied": bool}`    |
//! | `replica.snapshot` | `{}`                           | array of wire mutations|
//! | `agent.alive`      | [`AgentAliveParams`]           | `bool`                 |

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::IpcConfig;
use crate::error::{LocationError, Result};
use crate::models::NodeId;

pub const METHOD_PING: &str = "ping";
pub const METHOD_HELLO: &str = "peer.hello";
pub const METHOD_APPLY: &str = "replica.apply";
pub const METHOD_SNAPSHOT: &str = "replica.snapshot";
pub const METHOD_AGENT_ALIVE: &str = "agent.alive";

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(serde_json::Value::Number(id.into())),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Greeting sent every heartbeat to each known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloParams {
    pub node: NodeId,
    pub host: String,
    /// Address the sender accepts peer connections on.
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    pub node: NodeId,
    pub host: String,
    /// Fresh per process start; a change under the same node id is a restart.
    pub incarnation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAliveParams {
    pub path: String,
}

fn check_frame_len(len: usize) -> Result<()> {
    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(LocationError::Validation {
            field: "rpc_frame".to_string(),
            message: format!("{} byte frame over the {} byte limit", len, IpcConfig::MAX_MESSAGE_SIZE),
        });
    }
    Ok(())
}

/// Read one frame. `None` means the peer closed the connection between frames.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    check_frame_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    check_frame_len(payload.len())?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
