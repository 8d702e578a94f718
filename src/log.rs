//! The event log contract and an in-memory backend.
//!
//! An [`EventLog`] stores one append-only stream per
//! `(aggregate_type, instance_id)` pair. The only ordering it promises is
//! the order of records within a stream. Writers identify themselves with
//! an [`Epoch`] fencing token; once the log has been fenced at epoch `n`,
//! appends carrying an older epoch are rejected so that a demoted
//! supervisor cannot keep writing during a split-brain window.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::event::{ProposedEvent, RecordedEvent};

/// Monotonic fencing token handed out by the external leader election.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(u64);

impl Epoch {
    /// The epoch every log starts fenced at.
    pub const ZERO: Epoch = Epoch(0);

    /// Wrap a raw token.
    pub const fn new(token: u64) -> Self {
        Self(token)
    }

    /// The raw token value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The epoch immediately after this one.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable, per-stream append-only storage for events.
///
/// # Contract
///
/// - `append` is all-or-nothing: on `Err` nothing was stored.
/// - `append` assigns `sequence = previous + 1` (starting at 1).
/// - `read` returns every record of the stream in append order; an unknown
///   stream reads as empty.
/// - `fence` never lowers the fence. Appends and fences carrying an epoch
///   below the current fence fail with [`LogError::StaleEpoch`].
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Durably append one event to a stream.
    async fn append(
        &self,
        aggregate_type: &str,
        instance_id: &str,
        event: ProposedEvent,
        epoch: Epoch,
    ) -> Result<RecordedEvent, LogError>;

    /// Read a stream in persisted order.
    async fn read(
        &self,
        aggregate_type: &str,
        instance_id: &str,
    ) -> Result<Vec<RecordedEvent>, LogError>;

    /// Raise the fence to `epoch`, rejecting older writers from now on.
    async fn fence(&self, epoch: Epoch) -> Result<(), LogError>;

    /// The epoch the log is currently fenced at.
    async fn current_epoch(&self) -> Result<Epoch, LogError>;
}

/// Reject `attempted` if it is older than `current`.
pub(crate) fn check_epoch(attempted: Epoch, current: Epoch) -> Result<(), LogError> {
    if attempted < current {
        tracing::warn!(%attempted, %current, "rejecting write from stale epoch");
        return Err(LogError::StaleEpoch { attempted, current });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryStreams {
    streams: HashMap<(String, String), Vec<RecordedEvent>>,
    fence: Epoch,
}

/// Event log kept entirely in process memory.
///
/// Shared between nodes of an in-process cluster by wrapping it in an
/// `Arc`. Nothing survives a restart of the process.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    inner: Mutex<MemoryStreams>,
}

impl InMemoryLog {
    /// Create an empty log fenced at [`Epoch::ZERO`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a stream.
    pub fn len(&self, aggregate_type: &str, instance_id: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .streams
            .get(&(aggregate_type.to_owned(), instance_id.to_owned()))
            .map_or(0, Vec::len)
    }

    /// Whether no stream holds any record.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.streams.values().all(Vec::is_empty)
    }
}

#[async_trait]
impl EventLog for InMemoryLog {
    async fn append(
        &self,
        aggregate_type: &str,
        instance_id: &str,
        event: ProposedEvent,
        epoch: Epoch,
    ) -> Result<RecordedEvent, LogError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        check_epoch(epoch, inner.fence)?;
        let stream = inner
            .streams
            .entry((aggregate_type.to_owned(), instance_id.to_owned()))
            .or_default();
        let record = RecordedEvent::from_proposed(event, stream.len() as u64 + 1, epoch);
        stream.push(record.clone());
        Ok(record)
    }

    async fn read(
        &self,
        aggregate_type: &str,
        instance_id: &str,
    ) -> Result<Vec<RecordedEvent>, LogError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .streams
            .get(&(aggregate_type.to_owned(), instance_id.to_owned()))
            .cloned()
            .unwrap_or_default())
    }

    async fn fence(&self, epoch: Epoch) -> Result<(), LogError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        check_epoch(epoch, inner.fence)?;
        inner.fence = epoch;
        Ok(())
    }

    async fn current_epoch(&self) -> Result<Epoch, LogError> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).fence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandContext;
    use crate::event::encode_domain_event;
    use crate::todo::{Todo, TodoEvent};

    fn proposed(event: &TodoEvent) -> ProposedEvent {
        encode_domain_event::<Todo>(event, &CommandContext::default(), "t-1")
            .expect("encode should succeed")
    }

    #[tokio::test]
    async fn append_assigns_increasing_sequences() {
        let log = InMemoryLog::new();
        for expected in 1..=3 {
            let record = log
                .append("todo", "t-1", proposed(&TodoEvent::Completed), Epoch::ZERO)
                .await
                .expect("append should succeed");
            assert_eq!(record.sequence, expected);
        }

        let records = log.read("todo", "t-1").await.expect("read should succeed");
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let log = InMemoryLog::new();
        log.append("todo", "a", proposed(&TodoEvent::Deleted), Epoch::ZERO)
            .await
            .expect("append should succeed");
        let record = log
            .append("todo", "b", proposed(&TodoEvent::Deleted), Epoch::ZERO)
            .await
            .expect("append should succeed");

        assert_eq!(record.sequence, 1);
        assert_eq!(log.len("todo", "a"), 1);
        assert_eq!(log.len("todo", "b"), 1);
    }

    #[tokio::test]
    async fn unknown_stream_reads_empty() {
        let log = InMemoryLog::new();
        let records = log.read("todo", "nope").await.expect("read should succeed");
        assert!(records.is_empty());
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn fence_rejects_older_writers() {
        let log = InMemoryLog::new();
        log.fence(Epoch::new(2)).await.expect("fence should succeed");

        let err = log
            .append("todo", "t-1", proposed(&TodoEvent::Deleted), Epoch::new(1))
            .await
            .expect_err("stale append must fail");
        assert!(matches!(
            err,
            LogError::StaleEpoch { attempted, current }
                if attempted == Epoch::new(1) && current == Epoch::new(2)
        ));
        assert_eq!(log.len("todo", "t-1"), 0, "nothing may be persisted");

        log.append("todo", "t-1", proposed(&TodoEvent::Deleted), Epoch::new(3))
            .await
            .expect("newer writer is accepted");
    }

    #[tokio::test]
    async fn fence_never_moves_backwards() {
        let log = InMemoryLog::new();
        log.fence(Epoch::new(5)).await.expect("fence should succeed");
        assert!(log.fence(Epoch::new(4)).await.is_err());
        assert_eq!(
            log.current_epoch().await.expect("epoch"),
            Epoch::new(5)
        );
    }

    #[test]
    fn epoch_next_and_display() {
        let e = Epoch::new(41).next();
        assert_eq!(e.get(), 42);
        assert_eq!(e.to_string(), "42");
        assert!(Epoch::ZERO < e);
    }
}
