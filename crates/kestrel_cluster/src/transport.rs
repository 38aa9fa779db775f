//! Inter-process messaging between routers, shards and the config server.
//!
//! Every request travels in an [`Envelope`] carrying the sender's cluster
//! time, the authenticated principal and an absolute deadline; every reply
//! carries the receiver's cluster time back. [`RpcClient`] does the clock
//! gossip on both legs, so any component that talks through it keeps its
//! clock at or ahead of everything it has heard from.
//!
//! [`InProcessTransport`] delivers messages by direct call and is where
//! network faults are injected.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

use kestrel_common::authz::Principal;
use kestrel_common::error::ShardingError;
use kestrel_common::{ClusterClock, KestrelError, KestrelResult, LogicalTimestamp, ShardId};

use crate::fault_injection::FaultInjector;
use crate::messages::{ConfigRequest, ConfigResponse, ShardRequest, ShardResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Config,
    Shard(ShardId),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Config => write!(f, "config"),
            Endpoint::Shard(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub cluster_time: LogicalTimestamp,
    pub principal: Principal,
    pub deadline: Instant,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug)]
pub struct Reply<T> {
    pub cluster_time: LogicalTimestamp,
    pub body: KestrelResult<T>,
}

impl<T> Reply<T> {
    /// Stamp `body` with `clock`'s current time.
    pub fn new(clock: &ClusterClock, body: KestrelResult<T>) -> Self {
        Self {
            cluster_time: clock.now(),
            body,
        }
    }
}

pub trait ShardService: Send + Sync {
    fn handle(&self, req: Envelope<ShardRequest>) -> Reply<ShardResponse>;
}

pub trait ConfigService: Send + Sync {
    fn handle(&self, req: Envelope<ConfigRequest>) -> Reply<ConfigResponse>;
}

/// Delivery of envelopes. `Err` means the message or its reply was lost;
/// errors raised by the remote handler travel inside the [`Reply`].
pub trait ClusterTransport: Send + Sync {
    fn send_shard(
        &self,
        to: ShardId,
        req: Envelope<ShardRequest>,
    ) -> KestrelResult<Reply<ShardResponse>>;

    fn send_config(&self, req: Envelope<ConfigRequest>) -> KestrelResult<Reply<ConfigResponse>>;
}

// ── In-process transport ──

#[derive(Debug, Default)]
struct TransportMetrics {
    delivered: AtomicU64,
    failed: AtomicU64,
    deadline_exceeded: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct TransportSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub deadline_exceeded: u64,
}

pub struct InProcessTransport {
    shards: DashMap<ShardId, Arc<dyn ShardService>>,
    config: RwLock<Option<Arc<dyn ConfigService>>>,
    faults: Arc<FaultInjector>,
    metrics: TransportMetrics,
}

impl fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl InProcessTransport {
    pub fn new(faults: Arc<FaultInjector>) -> Arc<Self> {
        Arc::new(Self {
            shards: DashMap::new(),
            config: RwLock::new(None),
            faults,
            metrics: TransportMetrics::default(),
        })
    }

    pub fn register_shard(&self, id: ShardId, service: Arc<dyn ShardService>) {
        self.shards.insert(id, service);
    }

    pub fn deregister_shard(&self, id: ShardId) {
        self.shards.remove(&id);
    }

    pub fn register_config(&self, service: Arc<dyn ConfigService>) {
        *self.config.write() = Some(service);
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            delivered: self.metrics.delivered.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            deadline_exceeded: self.metrics.deadline_exceeded.load(Ordering::Relaxed),
        }
    }

    fn deliver<R>(
        &self,
        endpoint: Endpoint,
        kind: &'static str,
        deadline: Instant,
        call: impl FnOnce() -> R,
    ) -> KestrelResult<R> {
        if let Err(e) = self.faults.before_delivery(endpoint, kind) {
            self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        let latency = self.faults.latency();
        if !latency.is_zero() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(latency.min(remaining));
        }
        if Instant::now() >= deadline {
            self.metrics.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
            return Err(KestrelError::ExceededTimeLimit(format!(
                "{kind} to {endpoint} exceeded its deadline"
            )));
        }
        let reply = call();
        if let Err(e) = self.faults.after_delivery(endpoint, kind) {
            self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(reply)
    }
}

impl ClusterTransport for InProcessTransport {
    fn send_shard(
        &self,
        to: ShardId,
        req: Envelope<ShardRequest>,
    ) -> KestrelResult<Reply<ShardResponse>> {
        let service = self
            .shards
            .get(&to)
            .map(|s| Arc::clone(s.value()))
            .ok_or(ShardingError::ShardNotFound(to))?;
        let kind = req.body.kind();
        let deadline = req.deadline;
        self.deliver(Endpoint::Shard(to), kind, deadline, move || {
            service.handle(req)
        })
    }

    fn send_config(&self, req: Envelope<ConfigRequest>) -> KestrelResult<Reply<ConfigResponse>> {
        let service = self
            .config
            .read()
            .clone()
            .ok_or_else(|| {
                KestrelError::network(Endpoint::Config, "config server not registered")
            })?;
        let kind = req.body.kind();
        let deadline = req.deadline;
        self.deliver(Endpoint::Config, kind, deadline, move || service.handle(req))
    }
}

// ── Client ──

/// Sends requests on behalf of one component, gossiping its clock.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn ClusterTransport>,
    clock: Arc<ClusterClock>,
    principal: Principal,
    timeout: Duration,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("principal", &self.principal)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RpcClient {
    pub fn new(
        transport: Arc<dyn ClusterTransport>,
        clock: Arc<ClusterClock>,
        principal: Principal,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            clock,
            principal,
            timeout,
        }
    }

    pub fn clock(&self) -> &Arc<ClusterClock> {
        &self.clock
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Same transport and clock, acting as `principal`.
    pub fn as_principal(&self, principal: Principal) -> Self {
        Self {
            principal,
            ..self.clone()
        }
    }

    fn envelope<T>(&self, body: T) -> Envelope<T> {
        Envelope {
            cluster_time: self.clock.now(),
            principal: self.principal.clone(),
            deadline: Instant::now() + self.timeout,
            body,
        }
    }

    pub fn shard(&self, to: ShardId, body: ShardRequest) -> KestrelResult<ShardResponse> {
        let reply = self.transport.send_shard(to, self.envelope(body))?;
        self.clock.advance(reply.cluster_time);
        reply.body
    }

    pub fn config(&self, body: ConfigRequest) -> KestrelResult<ConfigResponse> {
        let reply = self.transport.send_config(self.envelope(body))?;
        self.clock.advance(reply.cluster_time);
        reply.body
    }
}
