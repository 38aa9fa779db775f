//! Per-document version chains.
//!
//! A chain is sorted by timestamp, oldest first. A `None` document is a
//! tombstone. Reads at `ts` see the newest version with `version.ts <= ts`.

use kestrel_common::{Document, LogicalTimestamp};

#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    pub ts: LogicalTimestamp,
    pub doc: Option<Document>,
}

#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: Vec<Version>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_at(&self, ts: LogicalTimestamp) -> Option<&Document> {
        let idx = self.versions.partition_point(|v| v.ts <= ts);
        if idx == 0 {
            return None;
        }
        self.versions[idx - 1].doc.as_ref()
    }

    pub fn latest(&self) -> Option<&Document> {
        self.versions.last().and_then(|v| v.doc.as_ref())
    }

    pub fn latest_ts(&self) -> Option<LogicalTimestamp> {
        self.versions.last().map(|v| v.ts)
    }

    /// Install a version. A write at an existing timestamp replaces that
    /// version; earlier timestamps are inserted in order.
    pub fn write(&mut self, ts: LogicalTimestamp, doc: Option<Document>) {
        let idx = self.versions.partition_point(|v| v.ts < ts);
        match self.versions.get_mut(idx) {
            Some(v) if v.ts == ts => v.doc = doc,
            _ => self.versions.insert(idx, Version { ts, doc }),
        }
    }

    /// Drop history no reader at or after `oldest` can observe.
    /// Returns the number of versions removed.
    pub fn prune(&mut self, oldest: LogicalTimestamp) -> usize {
        let visible_at_oldest = self.versions.partition_point(|v| v.ts <= oldest);
        if visible_at_oldest <= 1 {
            return 0;
        }
        let drop = visible_at_oldest - 1;
        self.versions.drain(..drop);
        drop
    }

    /// Remove every version newer than `ts`. Returns how many were removed.
    pub fn truncate_after(&mut self, ts: LogicalTimestamp) -> usize {
        let keep = self.versions.partition_point(|v| v.ts <= ts);
        let removed = self.versions.len() - keep;
        self.versions.truncate(keep);
        removed
    }

    /// True when the chain holds nothing but a tombstone at or before `oldest`.
    pub fn is_dead(&self, oldest: LogicalTimestamp) -> bool {
        self.versions.is_empty()
            || (self.versions.len() == 1
                && self.versions[0].doc.is_none()
                && self.versions[0].ts <= oldest)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
