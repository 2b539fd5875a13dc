//! In-process network with fault injection.
//!
//! [`SimNetwork`] implements [`Transport`] by decoding each request and
//! handing it to the [`SimService`] registered under the endpoint name.
//! [`FaultRule`]s select requests by endpoint and opcode and make them fail
//! the way a real network does: lost before delivery, lost after execution,
//! never answered, answered late, or rejected with an errno.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use oxlustre_core::protocol::{decode, encode};
use oxlustre_core::transport::{Endpoint, Transport};
use oxlustre_core::{AttrValid, MdBody, Opcode, Reply, Request, TransportError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// A service reachable over the simulated network.
#[async_trait]
pub trait SimService: Send + Sync {
    async fn handle(&self, request: Request) -> Reply;
}

/// What happens to a request a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Lost before reaching the service.
    Drop,
    /// Executed, but the reply is lost.
    DropReply,
    /// Never answered; the caller's timeout fires.
    Hang,
    /// Answered after a delay.
    Delay(Duration),
    /// Rejected with an errno without reaching the service.
    Errno(i32),
    /// Metadata replies come back with these validity bits cleared.
    MaskAttrs(AttrValid),
}

/// Selects requests and the fault applied to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRule {
    /// Endpoint name; `None` matches every endpoint.
    pub endpoint: Option<String>,
    /// `None` matches every opcode.
    pub opcode: Option<Opcode>,
    pub fault: Fault,
    /// How many more requests the rule applies to; `None` is unlimited.
    pub remaining: Option<u32>,
}

impl FaultRule {
    pub fn new(fault: Fault) -> Self {
        Self {
            endpoint: None,
            opcode: None,
            fault,
            remaining: None,
        }
    }

    #[must_use]
    pub fn on(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn op(mut self, opcode: Opcode) -> Self {
        self.opcode = Some(opcode);
        self
    }

    #[must_use]
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, endpoint: &str, opcode: Opcode) -> bool {
        self.endpoint.as_deref().is_none_or(|e| e == endpoint)
            && self.opcode.is_none_or(|o| o == opcode)
            && self.remaining.is_none_or(|n| n > 0)
    }
}

/// Identifies an injected rule so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(u64);

#[derive(Default)]
pub struct SimNetwork {
    services: DashMap<String, Arc<dyn SimService>>,
    rules: Mutex<Vec<(RuleId, FaultRule)>>,
    next_rule: AtomicU64,
    delivered: DashMap<(String, Opcode), u64>,
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("services", &self.services.len())
            .field("rules", &self.rules.lock().len())
            .finish_non_exhaustive()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, service: Arc<dyn SimService>) {
        self.services.insert(name.into(), service);
    }

    /// Take a service off the network; requests to it are lost.
    pub fn unregister(&self, name: &str) {
        self.services.remove(name);
    }

    pub fn inject(&self, rule: FaultRule) -> RuleId {
        let id = RuleId(self.next_rule.fetch_add(1, Ordering::Relaxed));
        debug!(?rule, "Fault injected");
        self.rules.lock().push((id, rule));
        id
    }

    pub fn remove(&self, id: RuleId) {
        self.rules.lock().retain(|(rule, _)| *rule != id);
    }

    pub fn clear_faults(&self) {
        self.rules.lock().clear();
    }

    /// Requests with `opcode` that reached the network for `endpoint`,
    /// faulted or not.
    pub fn request_count(&self, endpoint: &str, opcode: Opcode) -> u64 {
        self.delivered
            .get(&(endpoint.to_string(), opcode))
            .map_or(0, |n| *n)
    }

    fn take_fault(&self, endpoint: &str, opcode: Opcode) -> Option<Fault> {
        let mut rules = self.rules.lock();
        let (_, rule) = rules
            .iter_mut()
            .find(|(_, rule)| rule.matches(endpoint, opcode))?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.fault)
    }
}

fn mask_body(body: &mut MdBody, mask: AttrValid) {
    body.attrs.valid.remove(mask);
}

fn mask_reply(reply: &mut Reply, mask: AttrValid) {
    match reply {
        Reply::Body(body) | Reply::Removed(Some(body)) => mask_body(body, mask),
        Reply::Object { attrs, .. } => attrs.valid.remove(mask),
        _ => {}
    }
}

#[async_trait]
impl Transport for SimNetwork {
    async fn send(&self, endpoint: &Endpoint, request: Bytes) -> Result<Bytes, TransportError> {
        let request: Request = decode(&request).map_err(|_| TransportError::Remote(libc::EPROTO))?;
        let opcode = request.opcode();
        *self
            .delivered
            .entry((endpoint.name.clone(), opcode))
            .or_insert(0) += 1;

        let fault = self.take_fault(&endpoint.name, opcode);
        if let Some(fault) = fault {
            trace!(endpoint = %endpoint, ?opcode, ?fault, "Applying fault");
        }
        match fault {
            Some(Fault::Drop) => return Err(TransportError::ConnectionLost),
            Some(Fault::Hang) => std::future::pending::<()>().await,
            Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(Fault::Errno(errno)) => return Err(TransportError::Remote(errno)),
            Some(Fault::DropReply | Fault::MaskAttrs(_)) | None => {}
        }

        let service = self
            .services
            .get(&endpoint.name)
            .map(|s| Arc::clone(s.value()))
            .ok_or(TransportError::ConnectionLost)?;
        let mut reply = service.handle(request).await;

        match fault {
            Some(Fault::DropReply) => Err(TransportError::ConnectionLost),
            Some(Fault::MaskAttrs(mask)) => {
                mask_reply(&mut reply, mask);
                encode(&reply).map_err(|_| TransportError::Remote(libc::EPROTO))
            }
            _ => encode(&reply).map_err(|_| TransportError::Remote(libc::EPROTO)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl SimService for Echo {
        async fn handle(&self, _request: Request) -> Reply {
            Reply::Done
        }
    }

    fn network() -> SimNetwork {
        let net = SimNetwork::new();
        net.register("svc", Arc::new(Echo));
        net
    }

    async fn send(net: &SimNetwork, request: &Request) -> Result<Reply, TransportError> {
        let raw = net
            .send(&Endpoint::storage("svc"), encode(request).unwrap())
            .await?;
        Ok(decode(&raw).unwrap())
    }

    #[tokio::test]
    async fn test_delivery_and_counts() {
        let net = network();
        assert_eq!(send(&net, &Request::Statfs).await, Ok(Reply::Done));
        assert_eq!(net.request_count("svc", Opcode::Statfs), 1);
        assert_eq!(net.request_count("svc", Opcode::Commit), 0);
    }

    #[tokio::test]
    async fn test_rule_selection_and_expiry() {
        let net = network();
        net.inject(FaultRule::new(Fault::Errno(libc::EIO)).on("svc").op(Opcode::Statfs).times(1));

        assert_eq!(
            send(&net, &Request::Commit { token: 1 }).await,
            Ok(Reply::Done)
        );
        assert_eq!(
            send(&net, &Request::Statfs).await,
            Err(TransportError::Remote(libc::EIO))
        );
        assert_eq!(send(&net, &Request::Statfs).await, Ok(Reply::Done));
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_lost() {
        let net = network();
        let raw = encode(&Request::Statfs).unwrap();
        assert_eq!(
            net.send(&Endpoint::storage("nowhere"), raw).await,
            Err(TransportError::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn test_removed_rule_stops_applying() {
        let net = network();
        let id = net.inject(FaultRule::new(Fault::Drop));
        assert_eq!(
            send(&net, &Request::Statfs).await,
            Err(TransportError::ConnectionLost)
        );
        net.remove(id);
        assert_eq!(send(&net, &Request::Statfs).await, Ok(Reply::Done));
    }
}
