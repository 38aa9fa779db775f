//! Hybrid logical clock producing cluster time.
//!
//! Every node (and every router) owns a [`ClusterClock`]. Timestamps handed out
//! by `tick()` are strictly greater than anything the clock has issued or
//! observed through `advance()`, so gossiping the clock on every message keeps
//! causally related events ordered across replica sets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::types::LogicalTimestamp;

/// Source of physical seconds.
pub trait WallClock: Send + Sync {
    fn now_secs(&self) -> u32;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_secs(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }
}

/// Manually driven wall clock for deterministic tests.
#[derive(Debug)]
pub struct ManualWallClock {
    secs: AtomicU64,
}

impl ManualWallClock {
    pub fn new(start_secs: u32) -> Arc<Self> {
        Arc::new(Self {
            secs: AtomicU64::new(start_secs as u64),
        })
    }

    pub fn set(&self, secs: u32) {
        self.secs.store(secs as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by_secs: u32) {
        self.secs.fetch_add(by_secs as u64, Ordering::SeqCst);
    }
}

impl WallClock for ManualWallClock {
    fn now_secs(&self) -> u32 {
        self.secs.load(Ordering::SeqCst).min(u32::MAX as u64) as u32
    }
}

pub struct ClusterClock {
    wall: Arc<dyn WallClock>,
    latest: Mutex<LogicalTimestamp>,
    ticks: AtomicU64,
    advances: AtomicU64,
}

impl std::fmt::Debug for ClusterClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClock")
            .field("latest", &*self.latest.lock())
            .finish()
    }
}

impl ClusterClock {
    pub fn new(wall: Arc<dyn WallClock>) -> Arc<Self> {
        Arc::new(Self {
            wall,
            latest: Mutex::new(LogicalTimestamp::MIN),
            ticks: AtomicU64::new(0),
            advances: AtomicU64::new(0),
        })
    }

    pub fn system() -> Arc<Self> {
        Self::new(Arc::new(SystemWallClock))
    }

    /// Issue a new timestamp strictly greater than every timestamp issued or
    /// observed so far.
    pub fn tick(&self) -> LogicalTimestamp {
        let wall = self.wall.now_secs();
        let mut latest = self.latest.lock();
        let next = if wall > latest.secs {
            LogicalTimestamp::new(wall, 1)
        } else {
            latest.next()
        };
        *latest = next;
        self.ticks.fetch_add(1, Ordering::Relaxed);
        next
    }

    /// Latest timestamp issued or observed. Future `tick()`s are strictly greater.
    pub fn now(&self) -> LogicalTimestamp {
        *self.latest.lock()
    }

    /// Merge a gossiped cluster time.
    pub fn advance(&self, observed: LogicalTimestamp) {
        let mut latest = self.latest.lock();
        if observed > *latest {
            *latest = observed;
            self.advances.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn wall_secs(&self) -> u32 {
        self.wall.now_secs()
    }

    pub fn wall(&self) -> Arc<dyn WallClock> {
        Arc::clone(&self.wall)
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            latest: self.now(),
            ticks: self.ticks.load(Ordering::Relaxed),
            advances: self.advances.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClockSnapshot {
    pub latest: LogicalTimestamp,
    pub ticks: u64,
    pub advances: u64,
}
