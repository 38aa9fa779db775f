//! Resume tokens: opaque, totally ordered positions in a change stream.

use std::cmp::Ordering;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use kestrel_common::error::ChangeStreamError;
use kestrel_common::{CollectionUuid, KestrelResult, KeyValue, LogicalTimestamp, ShardId};

const TOKEN_VERSION: u8 = 1;

/// Events sort before the high-water mark at the same cluster time: a
/// high-water mark at `t` says every event at or before `t` was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Event,
    HighWaterMark,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken {
    pub version: u8,
    pub cluster_time: LogicalTimestamp,
    pub kind: TokenKind,
    pub shard: ShardId,
    /// Position of the event within its transaction.
    pub txn_op_index: u32,
    pub document_key: Option<KeyValue>,
    pub uuid: Option<CollectionUuid>,
    pub from_invalidate: bool,
}

impl ResumeToken {
    pub fn event(
        cluster_time: LogicalTimestamp,
        shard: ShardId,
        txn_op_index: u32,
        document_key: Option<KeyValue>,
        uuid: Option<CollectionUuid>,
    ) -> Self {
        Self {
            version: TOKEN_VERSION,
            cluster_time,
            kind: TokenKind::Event,
            shard,
            txn_op_index,
            document_key,
            uuid,
            from_invalidate: false,
        }
    }

    /// Token of the invalidate that follows the event `cause`.
    pub fn invalidate(cause: &ResumeToken) -> Self {
        Self {
            from_invalidate: true,
            ..cause.clone()
        }
    }

    pub fn high_water_mark(cluster_time: LogicalTimestamp) -> Self {
        Self {
            version: TOKEN_VERSION,
            cluster_time,
            kind: TokenKind::HighWaterMark,
            shard: ShardId(0),
            txn_op_index: 0,
            document_key: None,
            uuid: None,
            from_invalidate: false,
        }
    }

    /// Position just before the first event at `ts`.
    pub fn start_at(ts: LogicalTimestamp) -> Self {
        Self::high_water_mark(ts.prev())
    }

    pub fn is_high_water_mark(&self) -> bool {
        self.kind == TokenKind::HighWaterMark
    }

    pub fn encode(&self) -> KestrelResult<String> {
        let bytes = bincode::serialize(self).map_err(|e| {
            ChangeStreamError::Fatal(format!(
                "resume token at {} cannot be encoded: {e}",
                self.cluster_time
            ))
        })?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn decode(s: &str) -> KestrelResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| ChangeStreamError::InvalidResumeToken(format!("{s}: {e}")))?;
        let token: ResumeToken = bincode::deserialize(&bytes)
            .map_err(|e| ChangeStreamError::InvalidResumeToken(format!("{s}: {e}")))?;
        if token.version != TOKEN_VERSION {
            return Err(ChangeStreamError::InvalidResumeToken(format!(
                "unsupported token version {}",
                token.version
            ))
            .into());
        }
        Ok(token)
    }
}

impl Ord for ResumeToken {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cluster_time
            .cmp(&other.cluster_time)
            .then(self.kind.cmp(&other.kind))
            .then(self.shard.cmp(&other.shard))
            .then(self.txn_op_index.cmp(&other.txn_op_index))
            .then_with(|| self.document_key.cmp(&other.document_key))
            .then(self.from_invalidate.cmp(&other.from_invalidate))
            .then(self.uuid.cmp(&other.uuid))
    }
}

impl PartialOrd for ResumeToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: u32, counter: u32) -> LogicalTimestamp {
        LogicalTimestamp::new(secs, counter)
    }

    #[test]
    fn test_encode_decode_preserves_token() {
        let t = ResumeToken::event(
            ts(10, 2),
            ShardId(1),
            3,
            Some(KeyValue::Str("a".into())),
            Some(CollectionUuid::generate()),
        );
        let s = t.encode().unwrap();
        assert!(!s.contains('+') && !s.contains('/'));
        assert_eq!(ResumeToken::decode(&s).unwrap(), t);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = ResumeToken::decode("not a token!").unwrap_err();
        assert!(matches!(
            err,
            kestrel_common::KestrelError::ChangeStream(ChangeStreamError::InvalidResumeToken(_))
        ));
    }

    #[test]
    fn test_ordering() {
        let e1 = ResumeToken::event(ts(10, 1), ShardId(0), 0, Some(KeyValue::Int(1)), None);
        let e2 = ResumeToken::event(ts(10, 1), ShardId(0), 1, Some(KeyValue::Int(0)), None);
        let e3 = ResumeToken::event(ts(10, 1), ShardId(1), 0, Some(KeyValue::Int(0)), None);
        let hwm = ResumeToken::high_water_mark(ts(10, 1));
        let later = ResumeToken::event(ts(10, 2), ShardId(0), 0, None, None);
        assert!(e1 < e2 && e2 < e3 && e3 < hwm && hwm < later);
        assert!(e1 < ResumeToken::invalidate(&e1));
        assert!(ResumeToken::start_at(ts(10, 1)) < e1);
    }
}
