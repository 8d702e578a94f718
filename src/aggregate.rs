//! Aggregate trait and the replay fold.

use serde::{Serialize, de::DeserializeOwned};

use crate::event::{RecordedEvent, decode_domain_event};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through [`apply`](Aggregate::apply)
/// and is never stored directly; only events are durable.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) is a pure decision function: no I/O, no
///   side effects. It validates a command against the current state and
///   returns the events to persist. `Ok(vec![])` means "accepted, nothing
///   to record".
/// - [`apply`](Aggregate::apply) is a pure, total function. The same event
///   sequence must always produce the same state, whether folded live or
///   during replay.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "todo"). Used as a directory name.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    ///
    /// Must serialize adjacently tagged: `#[serde(tag = "type", content = "data")]`.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// Fold a stream's durable records into aggregate state, in order.
///
/// Records whose type this aggregate does not understand are skipped
/// (forward compatibility). Returns the state together with the last
/// sequence number seen, `0` for an empty stream.
pub fn replay<A: Aggregate>(records: &[RecordedEvent]) -> (A, u64) {
    records
        .iter()
        .fold((A::default(), 0), |(state, _), record| {
            let next = match decode_domain_event::<A>(record) {
                Some(event) => state.apply(&event),
                None => {
                    tracing::warn!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        event_type = %record.event_type,
                        sequence = record.sequence,
                        "skipping undecodable event during replay"
                    );
                    state
                }
            };
            (next, record.sequence)
        })
}
