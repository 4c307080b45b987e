//! Client side of a peer connection.
//!
//! The stream sits behind a tokio `Mutex`, so calls from concurrent tasks
//! are serialized on the one connection. A call that times out or fails
//! mid-exchange drops the stream, since a late reply would otherwise be read
//! by the next call; the following call reconnects.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::protocol::{read_frame, write_frame, RpcRequest, RpcResponse};
use crate::config::IpcConfig;
use crate::error::{LocationError, Result};

#[derive(Debug)]
pub struct PeerClient {
    stream: Mutex<Option<TcpStream>>,
    addr: SocketAddr,
    next_id: AtomicU64,
    call_timeout: Duration,
}

impl PeerClient {
    /// Connect within [`IpcConfig::CONNECT_TIMEOUT`].
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = Self::open(addr).await?;
        debug!("Connected to peer at {}", addr);

        Ok(Self {
            stream: Mutex::new(Some(stream)),
            addr,
            next_id: AtomicU64::new(1),
            call_timeout: IpcConfig::CALL_TIMEOUT,
        })
    }

    async fn open(addr: SocketAddr) -> Result<TcpStream> {
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| LocationError::PeerUnreachable { addr })?
            .map_err(|_| LocationError::PeerUnreachable { addr })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    #[cfg(test)]
    pub(crate) fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Call a method, bounded by [`IpcConfig::CALL_TIMEOUT`].
    ///
    /// A broken, silent or out-of-step connection yields `PeerUnreachable`;
    /// an error object from the peer is surfaced as `Other`.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_bytes = serde_json::to_vec(&RpcRequest::new(method, params, id))?;

        let mut slot = self.stream.lock().await;
        if slot.is_none() {
            debug!("Reconnecting to peer at {}", self.addr);
            *slot = Some(Self::open(self.addr).await?);
        }
        let Some(stream) = slot.as_mut() else {
            return Err(LocationError::PeerUnreachable { addr: self.addr });
        };

        let exchanged =
            tokio::time::timeout(self.call_timeout, Self::exchange(stream, &request_bytes)).await;

        let response = match exchanged {
            Ok(Ok(Some(bytes))) => serde_json::from_slice::<RpcResponse>(&bytes)
                .ok()
                .filter(|response| response.id == Some(serde_json::Value::Number(id.into()))),
            _ => None,
        };
        let Some(response) = response else {
            debug!("Dropping connection to {} after failed {} call", self.addr, method);
            *slot = None;
            return Err(LocationError::PeerUnreachable { addr: self.addr });
        };
        drop(slot);

        if let Some(err) = response.error {
            return Err(LocationError::Other(err.message));
        }

        response
            .result
            .ok_or_else(|| LocationError::Other("response missing result".to_string()))
    }

    async fn exchange(stream: &mut TcpStream, request: &[u8]) -> Result<Option<Vec<u8>>> {
        let (mut reader, mut writer) = stream.split();
        write_frame(&mut writer, request).await?;
        read_frame(&mut reader).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::server::{RpcDispatch, RpcServer};
    use std::sync::Arc;

    struct TestDispatch;

    #[async_trait::async_trait]
    impl RpcDispatch for TestDispatch {
        async fn dispatch(
            &self,
            method: &str,
            _params: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, LocationError> {
            match method {
                "ping" => Ok(serde_json::json!("pong")),
                "slow" => {
                    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                    Ok(serde_json::json!("late"))
                }
                _ => Err(LocationError::InvalidParams {
                    message: format!("Unknown method: {}", method),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_client_call_success() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut handle = RpcServer::start(addr, Arc::new(TestDispatch)).await.unwrap();

        let client = PeerClient::connect(handle.addr()).await.unwrap();
        let result = client.call("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!("pong"));

        let err = client.call("nonexistent", serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Unknown method"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_dead_peer_is_unreachable() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        match PeerClient::connect(addr).await {
            Err(LocationError::PeerUnreachable { addr: reported }) => assert_eq!(reported, addr),
            other => panic!("Expected PeerUnreachable, got: {:?}", other.map(|c| c.addr())),
        }
    }

    #[tokio::test]
    async fn test_client_detects_server_shutdown() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut handle = RpcServer::start(addr, Arc::new(TestDispatch)).await.unwrap();
        let client = PeerClient::connect(handle.addr()).await.unwrap();
        assert!(client.call("ping", serde_json::json!({})).await.is_ok());

        handle.shutdown();

        let mut detected_shutdown = false;
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if client.call("ping", serde_json::json!({})).await.is_err() {
                detected_shutdown = true;
                break;
            }
        }
        assert!(detected_shutdown, "client should notice the peer went away");
    }

    #[tokio::test]
    async fn test_timed_out_reply_is_not_read_by_next_call() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut handle = RpcServer::start(addr, Arc::new(TestDispatch)).await.unwrap();
        let client = PeerClient::connect(handle.addr())
            .await
            .unwrap()
            .with_call_timeout(std::time::Duration::from_millis(50));

        assert!(matches!(
            client.call("slow", serde_json::json!({})).await,
            Err(LocationError::PeerUnreachable { .. })
        ));
        // Let the late reply land on the abandoned connection.
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        let result = client.call("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!("pong"));

        handle.shutdown();
    }
}
