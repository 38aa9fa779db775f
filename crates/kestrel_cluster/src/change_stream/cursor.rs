//! Router-side change stream cursor.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use kestrel_common::authz::Principal;
use kestrel_common::error::ChangeStreamError;
use kestrel_common::pipeline::{Pipeline, PipelineExecutor};
use kestrel_common::{Document, KestrelResult, LogicalTimestamp, ShardId};

use super::{
    ChangeEvent, ChangeStreamOptions, EventFilter, FullDocumentMode, OperationType, PreImageMode,
    ResumeToken, ShardStreamRequest, WatchTarget,
};
use crate::messages::{ConfigRequest, ShardRequest};
use crate::transport::RpcClient;

#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub events: Vec<ChangeEvent>,
    /// `events` after the pipeline, in client form.
    pub documents: Vec<Document>,
    pub post_batch_resume_token: ResumeToken,
}

#[derive(Debug)]
struct ShardStream {
    after: ResumeToken,
    high_water: LogicalTimestamp,
    buffered: VecDeque<ChangeEvent>,
}

impl ShardStream {
    fn starting_at(token: &ResumeToken) -> Self {
        Self {
            after: token.clone(),
            high_water: if token.is_high_water_mark() {
                token.cluster_time
            } else {
                token.cluster_time.prev()
            },
            buffered: VecDeque::new(),
        }
    }
}

pub struct ChangeStreamCursor {
    rpc: RpcClient,
    /// Internal identity for catalog lookups.
    catalog: RpcClient,
    target: WatchTarget,
    full_document: FullDocumentMode,
    before_change: PreImageMode,
    filter: EventFilter,
    pipeline: Pipeline,
    executor: Arc<dyn PipelineExecutor>,
    batch_size: usize,
    shards: BTreeMap<ShardId, ShardStream>,
    resume_token: ResumeToken,
    closed: bool,
}

impl std::fmt::Debug for ChangeStreamCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStreamCursor")
            .field("target", &self.target)
            .field("shards", &self.shards.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl ChangeStreamCursor {
    pub fn open(
        rpc: RpcClient,
        target: WatchTarget,
        options: ChangeStreamOptions,
        executor: Arc<dyn PipelineExecutor>,
    ) -> KestrelResult<Self> {
        let start = match (
            options.resume_after,
            options.start_after,
            options.start_at_operation_time,
        ) {
            (Some(token), None, None) => {
                if token.from_invalidate {
                    return Err(ChangeStreamError::InvalidResumeToken(
                        "cannot resume after an invalidate; use startAfter".into(),
                    )
                    .into());
                }
                token
            }
            (None, Some(token), None) => token,
            (None, None, Some(ts)) => ResumeToken::start_at(ts),
            (None, None, None) => ResumeToken::high_water_mark(rpc.clock().now()),
            _ => {
                return Err(ChangeStreamError::InvalidResumeToken(
                    "only one of resumeAfter, startAfter and startAtOperationTime may be set"
                        .into(),
                )
                .into())
            }
        };
        let mut cursor = Self {
            catalog: rpc.as_principal(Principal::Internal),
            rpc,
            target,
            full_document: options.full_document,
            before_change: options.full_document_before_change,
            filter: options.filter,
            pipeline: options.pipeline,
            executor,
            batch_size: options.batch_size,
            shards: BTreeMap::new(),
            resume_token: start,
            closed: false,
        };
        cursor.sync_shards()?;
        kestrel_observability::record_change_stream_opened(cursor.target.kind());
        tracing::debug!(
            target = %cursor.target,
            shards = cursor.shards.len(),
            "change stream opened",
        );
        Ok(cursor)
    }

    pub fn resume_token(&self) -> &ResumeToken {
        &self.resume_token
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Track shards added since the last batch from the current resume
    /// point, and stop tracking drained removed ones.
    fn sync_shards(&mut self) -> KestrelResult<()> {
        let listed = self
            .catalog
            .config(ConfigRequest::ListShards)?
            .into_shards()?;
        for s in &listed {
            self.shards
                .entry(s.id)
                .or_insert_with(|| ShardStream::starting_at(&self.resume_token));
        }
        self.shards
            .retain(|id, s| listed.iter().any(|l| l.id == *id) || !s.buffered.is_empty());
        Ok(())
    }

    fn fetch(&mut self) -> KestrelResult<()> {
        for (&id, stream) in self.shards.iter_mut() {
            let req = ShardStreamRequest {
                target: self.target.clone(),
                after: stream.after.clone(),
                limit: self.batch_size,
                full_document: self.full_document,
                before_change: self.before_change,
                filter: self.filter.clone(),
            };
            let batch = match self
                .rpc
                .shard(id, ShardRequest::ChangeStreamFetch(req))
                .and_then(|r| r.into_changes())
            {
                Ok(b) => b,
                Err(e) if e.is_network_like() || e.is_retryable() => {
                    // The shard's high-water mark holds the stream back
                    // until it answers again.
                    tracing::debug!(
                        shard = %id,
                        error = %e,
                        "change stream fetch failed, will retry",
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            stream.buffered.extend(batch.events);
            stream.high_water = stream.high_water.max(batch.high_water);
            let hwm = ResumeToken::high_water_mark(stream.high_water);
            if hwm > stream.after {
                stream.after = hwm;
            }
        }
        Ok(())
    }

    /// Next batch of events. Returns an empty batch when nothing new is
    /// safely known yet; its resume token still advances.
    pub fn next_batch(&mut self) -> KestrelResult<ChangeBatch> {
        if self.closed {
            return Err(ChangeStreamError::Invalidated.into());
        }
        self.sync_shards()?;
        self.fetch()?;

        let safe = self
            .shards
            .values()
            .map(|s| s.high_water)
            .min()
            .unwrap_or(self.resume_token.cluster_time);
        let limit = if self.batch_size == 0 { usize::MAX } else { self.batch_size };
        let mut events: Vec<ChangeEvent> = Vec::new();
        let mut cut = false;
        loop {
            let next = self
                .shards
                .iter()
                .filter_map(|(id, s)| s.buffered.front().map(|e| (*id, e)))
                .filter(|(_, e)| e.cluster_time <= safe)
                .min_by(|a, b| a.1.token.cmp(&b.1.token))
                .map(|(id, _)| id);
            let Some(id) = next else { break };
            if events.len() >= limit {
                cut = true;
                break;
            }
            let Some(event) = self.shards.get_mut(&id).and_then(|s| s.buffered.pop_front()) else {
                break;
            };
            if event.token <= self.resume_token {
                continue;
            }
            let invalidate = event.operation_type == OperationType::Invalidate;
            events.push(event);
            if invalidate {
                self.closed = true;
                break;
            }
        }

        let mut token = self.resume_token.clone();
        if let Some(last) = events.last() {
            token = token.max(last.token.clone());
        }
        if !cut && !self.closed {
            token = token.max(ResumeToken::high_water_mark(safe));
        }
        self.resume_token = token.clone();

        let documents = events
            .iter()
            .map(ChangeEvent::to_document)
            .collect::<KestrelResult<Vec<Document>>>()?;
        let documents = if self.pipeline.is_empty() {
            documents
        } else {
            self.executor.execute(&self.pipeline, documents)?
        };
        kestrel_observability::record_change_stream_batch(events.len());
        if self.closed {
            tracing::info!(target = %self.target, "change stream invalidated");
        }
        Ok(ChangeBatch {
            events,
            documents,
            post_batch_resume_token: token,
        })
    }
}
