//! Peer-facing RPC server.
//!
//! Accepts connections from other registry nodes and dispatches JSON-RPC
//! method calls to the local node. Each connection is served by its own task
//! holding one permit of the connection semaphore.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::protocol::{read_frame, write_frame, RpcRequest, RpcResponse};
use crate::config::IpcConfig;
use crate::error::{LocationError, Result};

/// Handle to a running server. Dropping shuts down the server.
pub struct RpcServerHandle {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl RpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close active ones.
    pub fn shutdown(&mut self) {
        self.stop.send_replace(true);
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// Dispatches method calls received from peers.
#[async_trait::async_trait]
pub trait RpcDispatch: Send + Sync + 'static {
    async fn dispatch(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, LocationError>;
}

pub struct RpcServer;

impl RpcServer {
    /// Bind `addr` (port 0 picks a free port) and serve in background tasks.
    #[cfg(test)]
    pub(crate) async fn start<D: RpcDispatch>(addr: SocketAddr, dispatch: Arc<D>) -> Result<RpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        Self::serve(listener, dispatch)
    }

    /// Serve on an already bound listener.
    pub fn serve<D: RpcDispatch>(listener: TcpListener, dispatch: Arc<D>) -> Result<RpcServerHandle> {
        let addr = listener.local_addr()?;
        let (stop, stopped) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(IpcConfig::MAX_CONNECTIONS));

        info!("Peer server listening on {}", addr);
        let accept_task = tokio::spawn(Self::accept_loop(listener, dispatch, stopped, slots));

        Ok(RpcServerHandle {
            addr,
            stop,
            accept_task: Some(accept_task),
        })
    }

    async fn accept_loop<D: RpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        mut stopped: watch::Receiver<bool>,
        slots: Arc<Semaphore>,
    ) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = stopped.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Peer accept error: {}", e);
                        continue;
                    }
                },
            };

            let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                warn!(
                    "Rejecting peer connection from {}: {} connections open",
                    peer,
                    IpcConfig::MAX_CONNECTIONS
                );
                continue;
            };

            tokio::spawn(Self::serve_peer(
                stream,
                peer,
                Arc::clone(&dispatch),
                stopped.clone(),
                permit,
            ));
        }
        info!("Peer server stopped");
    }

    async fn serve_peer<D: RpcDispatch>(
        stream: TcpStream,
        peer: SocketAddr,
        dispatch: Arc<D>,
        mut stopped: watch::Receiver<bool>,
        _permit: OwnedSemaphorePermit,
    ) {
        debug!("Peer connection from {}", peer);
        let outcome = tokio::select! {
            _ = stopped.wait_for(|stop| *stop) => Ok(()),
            outcome = Self::exchange(stream, &*dispatch) => outcome,
        };
        if let Err(e) = outcome {
            debug!("Peer connection {} ended: {}", peer, e);
        }
    }

    /// Answer frames until the peer hangs up.
    async fn exchange<D: RpcDispatch>(mut stream: TcpStream, dispatch: &D) -> Result<()> {
        let (mut reader, mut writer) = stream.split();
        while let Some(frame) = read_frame(&mut reader).await? {
            let response = Self::respond(&frame, dispatch).await;
            write_frame(&mut writer, &serde_json::to_vec(&response)?).await?;
        }
        Ok(())
    }

    async fn respond<D: RpcDispatch>(frame: &[u8], dispatch: &D) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_slice(frame) {
            Ok(request) => request,
            Err(e) => return RpcResponse::error(None, -32700, format!("Parse error: {}", e)),
        };
        if request.jsonrpc != "2.0" {
            return RpcResponse::error(
                request.id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            );
        }

        let params = request
            .params
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
        match dispatch.dispatch(&request.method, params).await {
            Ok(result) => RpcResponse::success(request.id, result),
            Err(e) => RpcResponse::error(request.id, e.to_rpc_error_code(), e.to_string()),
        }
    }
}
