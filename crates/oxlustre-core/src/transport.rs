//! Transport seam and the RPC client built on it.
//!
//! The [`Transport`] moves opaque request blobs to a named endpoint and
//! returns the reply blob. [`RpcClient`] adds what every caller needs on top:
//! encoding, a per-request timeout, resends of idempotent requests, and an
//! import state (connected / disconnected) that subscribers can watch.

use crate::error::{RpcError, TransportError};
use crate::protocol::{self, Reply, Request};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

/// Which kind of service an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Metadata,
    Storage,
}

/// Addressable service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub name: String,
    pub kind: ServiceKind,
}

impl Endpoint {
    pub fn metadata(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServiceKind::Metadata,
        }
    }

    pub fn storage(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServiceKind::Storage,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Request/reply delivery to a named endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &Endpoint, request: Bytes) -> Result<Bytes, TransportError>;
}

/// Timeout and resend policy for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Resends allowed for idempotent requests.
    pub max_resends: u32,
    /// Pause before each resend.
    pub resend_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_resends: 3,
            resend_delay: Duration::from_millis(100),
        }
    }
}

/// Connection state of an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    New,
    Active,
    Disconnected,
    Closed,
}

/// Import state change delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEvent {
    pub target: String,
    pub state: ImportState,
}

/// RPC client bound to one endpoint.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    policy: RetryPolicy,
    state: Mutex<ImportState>,
    events: broadcast::Sender<ImportEvent>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .field("policy", &self.policy)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>, endpoint: Endpoint, policy: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            transport,
            endpoint,
            policy,
            state: Mutex::new(ImportState::New),
            events,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn target(&self) -> &str {
        &self.endpoint.name
    }

    pub fn state(&self) -> ImportState {
        *self.state.lock()
    }

    /// Watch import state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.events.subscribe()
    }

    /// Mark the import closed after an orderly disconnect.
    pub fn close(&self) {
        self.set_state(ImportState::Closed);
    }

    fn set_state(&self, next: ImportState) {
        let mut state = self.state.lock();
        if *state == next || *state == ImportState::Closed {
            return;
        }
        *state = next;
        drop(state);
        debug!(target_name = %self.endpoint, ?next, "Import state changed");
        // No subscribers is fine
        let _ = self.events.send(ImportEvent {
            target: self.endpoint.name.clone(),
            state: next,
        });
    }

    /// Send a request and wait for its reply.
    ///
    /// Timeouts and lost connections are retried only for idempotent
    /// requests. A reply carrying an errno becomes [`RpcError::Remote`] and is
    /// never retried.
    #[instrument(level = "trace", skip(self, request), fields(endpoint = %self.endpoint, op = ?request.opcode()))]
    pub async fn call(&self, request: &Request) -> Result<Reply, RpcError> {
        let blob = protocol::encode(request)?;
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(
                self.policy.timeout,
                self.transport.send(&self.endpoint, blob.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };

            match outcome {
                Ok(raw) => {
                    self.set_state(ImportState::Active);
                    return match protocol::decode::<Reply>(&raw)? {
                        Reply::Error { errno } => Err(RpcError::Remote {
                            target: self.endpoint.name.clone(),
                            errno,
                        }),
                        reply => Ok(reply),
                    };
                }
                Err(TransportError::Remote(errno)) => {
                    return Err(RpcError::Remote {
                        target: self.endpoint.name.clone(),
                        errno,
                    });
                }
                Err(err) => {
                    if err == TransportError::ConnectionLost {
                        self.set_state(ImportState::Disconnected);
                    }
                    if request.is_idempotent() && attempt < self.policy.max_resends {
                        attempt += 1;
                        warn!(
                            target_name = %self.endpoint,
                            op = ?request.opcode(),
                            attempt,
                            error = %err,
                            "Resending request"
                        );
                        tokio::time::sleep(self.policy.resend_delay).await;
                        continue;
                    }
                    return Err(RpcError::Transport {
                        target: self.endpoint.name.clone(),
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::Fid;
    use crate::attr::AttrValid;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` sends, then answers `Done`.
    struct Flaky {
        failures: u32,
        error: TransportError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn send(&self, _endpoint: &Endpoint, _request: Bytes) -> Result<Bytes, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(protocol::encode(&Reply::Done).unwrap())
            }
        }
    }

    fn client(failures: u32, error: TransportError) -> (Arc<Flaky>, RpcClient) {
        let flaky = Arc::new(Flaky {
            failures,
            error,
            calls: AtomicU32::new(0),
        });
        let policy = RetryPolicy {
            timeout: Duration::from_secs(1),
            max_resends: 2,
            resend_delay: Duration::from_millis(1),
        };
        let rpc = RpcClient::new(flaky.clone(), Endpoint::storage("ost0"), policy);
        (flaky, rpc)
    }

    #[tokio::test]
    async fn test_idempotent_request_resent() {
        let (flaky, rpc) = client(2, TransportError::Timeout);
        let reply = rpc.call(&Request::Statfs).await.unwrap();
        assert_eq!(reply, Reply::Done);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_resends_exhausted() {
        let (flaky, rpc) = client(5, TransportError::Timeout);
        let err = rpc.call(&Request::Statfs).await.unwrap_err();
        assert_eq!(err.errno(), libc::ETIMEDOUT);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_idempotent_not_resent() {
        let (flaky, rpc) = client(1, TransportError::ConnectionLost);
        let req = Request::Unlink {
            parent: Fid::new(1, 0, 0),
            name: "f".into(),
            kind: 0,
        };
        assert!(rpc.call(&req).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert_eq!(rpc.state(), ImportState::Disconnected);
    }

    #[tokio::test]
    async fn test_remote_error_not_retried() {
        let (flaky, rpc) = client(3, TransportError::Remote(libc::EACCES));
        let req = Request::Getattr {
            fid: Fid::new(1, 0, 0),
            valid: AttrValid::BASIC,
        };
        let err = rpc.call(&req).await.unwrap_err();
        assert!(err.is_remote(libc::EACCES));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_state_events() {
        let (_flaky, rpc) = client(1, TransportError::ConnectionLost);
        let mut events = rpc.subscribe();
        rpc.call(&Request::Statfs).await.unwrap();
        assert_eq!(events.recv().await.unwrap().state, ImportState::Disconnected);
        assert_eq!(events.recv().await.unwrap().state, ImportState::Active);
    }
}
