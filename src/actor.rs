//! Actor loop that owns one aggregate instance and processes its commands.
//!
//! Each actor is a tokio task fed by a bounded `mpsc` channel, so commands
//! for one instance run strictly one at a time in arrival order while
//! different instances run in parallel. On start the actor replays the
//! instance's stream; messages sent meanwhile wait in the channel.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle) and
//! [`spawn_actor`] (starts an actor that never idles out).

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::aggregate::{Aggregate, replay};
use crate::command::CommandContext;
use crate::error::{ExecuteError, LogError, StateError};
use crate::event::encode_domain_event;
use crate::log::{Epoch, EventLog};

/// An idle timeout long enough to never fire. `u64::MAX / 2` seconds keeps
/// tokio from overflowing when it adds the duration to `Instant::now()`.
pub(crate) const NEVER: Duration = Duration::from_secs(u64::MAX / 2);

/// Configuration for one actor.
#[derive(Debug, Clone)]
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before shutting down.
    pub idle_timeout: Duration,
    /// Capacity of the actor's mailbox.
    pub mailbox_capacity: usize,
    /// Fencing token stamped on every append.
    pub epoch: Epoch,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: NEVER,
            mailbox_capacity: 32,
            epoch: Epoch::ZERO,
        }
    }
}

/// Result type sent back through the `Execute` reply channel.
type ExecuteResult<A> =
    Result<Vec<<A as Aggregate>::DomainEvent>, ExecuteError<<A as Aggregate>::Error>>;

/// Messages sent from `AggregateHandle` to the actor loop.
pub(crate) enum ActorMessage<A: Aggregate> {
    /// Execute a command against the aggregate.
    Execute {
        cmd: A::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<ExecuteResult<A>>,
    },

    /// Retrieve the current aggregate state.
    GetState {
        reply: oneshot::Sender<Result<A, StateError>>,
    },

    /// Stop without processing anything still queued.
    Shutdown,
}

/// Everything the actor loop owns.
struct Actor<A: Aggregate> {
    instance_id: Arc<str>,
    log: Arc<dyn EventLog>,
    config: ActorConfig,
    state: A,
    /// Sequence of the last record folded into `state`.
    last_sequence: u64,
}

impl<A: Aggregate> Actor<A> {
    /// Rebuild state from the full stream.
    async fn recover(&mut self) -> Result<(), LogError> {
        let records = self.log.read(A::AGGREGATE_TYPE, &self.instance_id).await?;
        let (state, last_sequence) = replay::<A>(&records);
        self.state = state;
        self.last_sequence = last_sequence;
        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            instance_id = %self.instance_id,
            events = records.len(),
            "actor recovered"
        );
        Ok(())
    }

    /// Decide, persist each event, then fold it. Nothing is applied unless
    /// its append succeeded.
    async fn execute(&mut self, cmd: A::Command, ctx: &CommandContext) -> ExecuteResult<A> {
        let domain_events = self.state.handle(cmd).map_err(ExecuteError::Domain)?;
        if domain_events.is_empty() {
            return Ok(domain_events);
        }

        for event in &domain_events {
            let proposed = encode_domain_event::<A>(event, ctx, &self.instance_id)
                .map_err(LogError::from)?;
            let record = self
                .log
                .append(
                    A::AGGREGATE_TYPE,
                    &self.instance_id,
                    proposed,
                    self.config.epoch,
                )
                .await
                .inspect_err(|e| tracing::error!(error = %e, "append failed, command aborted"))?;

            if record.sequence == self.last_sequence + 1 {
                self.state = std::mem::take(&mut self.state).apply(event);
                self.last_sequence = record.sequence;
            } else {
                // Someone else wrote to this stream; our fold is stale.
                tracing::warn!(
                    expected = self.last_sequence + 1,
                    actual = record.sequence,
                    "foreign write detected, replaying stream"
                );
                self.recover().await?;
            }
        }

        tracing::info!(count = domain_events.len(), "events appended");
        Ok(domain_events)
    }

    /// Handle one message. Returns `false` when the loop must stop.
    async fn handle(&mut self, msg: ActorMessage<A>) -> bool {
        match msg {
            ActorMessage::Execute { cmd, ctx, reply } => {
                let span = tracing::info_span!(
                    "execute",
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id = %self.instance_id,
                    correlation_id = ctx.correlation_id.as_deref(),
                );
                let result = self.execute(cmd, &ctx).instrument(span).await;
                // The caller may have timed out; the outcome stands regardless.
                let _ = reply.send(result);
                true
            }
            ActorMessage::GetState { reply } => {
                let _ = reply.send(Ok(self.state.clone()));
                true
            }
            ActorMessage::Shutdown => false,
        }
    }
}

/// Runs the aggregate actor loop until idle timeout, shutdown, or until
/// every handle has been dropped.
async fn run_actor<A: Aggregate>(mut actor: Actor<A>, mut rx: mpsc::Receiver<ActorMessage<A>>) {
    if let Err(e) = actor.recover().await {
        tracing::error!(
            aggregate_type = A::AGGREGATE_TYPE,
            instance_id = %actor.instance_id,
            error = %e,
            "actor recovery failed"
        );
        rx.close();
        while let Some(msg) = rx.recv().await {
            reject_recovery_failure(msg, &e);
        }
        return;
    }

    loop {
        match tokio::time::timeout(actor.config.idle_timeout, rx.recv()).await {
            Ok(Some(msg)) => {
                if !actor.handle(msg).await {
                    rx.close();
                    while let Some(msg) = rx.recv().await {
                        reject_undelivered(msg);
                    }
                    break;
                }
            }
            // Channel closed: all senders dropped.
            Ok(None) => break,
            Err(_elapsed) => {
                tracing::info!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id = %actor.instance_id,
                    "actor idle, shutting down"
                );
                // Refuse new messages, but finish what was already accepted.
                rx.close();
                while let Some(msg) = rx.recv().await {
                    actor.handle(msg).await;
                }
                break;
            }
        }
    }
}

fn reject_recovery_failure<A: Aggregate>(msg: ActorMessage<A>, cause: &LogError) {
    let err = || LogError::Io(io::Error::other(format!("actor recovery failed: {cause}")));
    match msg {
        ActorMessage::Execute { reply, .. } => {
            let _ = reply.send(Err(ExecuteError::Log(err())));
        }
        ActorMessage::GetState { reply } => {
            let _ = reply.send(Err(StateError::Log(err())));
        }
        ActorMessage::Shutdown => {}
    }
}

fn reject_undelivered<A: Aggregate>(msg: ActorMessage<A>) {
    match msg {
        ActorMessage::Execute { reply, .. } => {
            let _ = reply.send(Err(ExecuteError::ActorGone));
        }
        ActorMessage::GetState { reply } => {
            let _ = reply.send(Err(StateError::ActorGone));
        }
        ActorMessage::Shutdown => {}
    }
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`.
pub struct AggregateHandle<A: Aggregate> {
    sender: mpsc::Sender<ActorMessage<A>>,
    /// Closed (sender dropped) once the actor task has returned.
    stopped: watch::Receiver<()>,
    instance_id: Arc<str>,
}

// Manual `Clone` and `Debug`: `A` itself need not implement either.
impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
            instance_id: Arc::clone(&self.instance_id),
        }
    }
}

impl<A: Aggregate> fmt::Debug for AggregateHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("instance_id", &self.instance_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Send a command to the aggregate and wait for the result.
    ///
    /// Returns the domain events produced by the command; they are durable
    /// by the time this returns `Ok`.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Log`] -- the event could not be persisted.
    /// * [`ExecuteError::ActorGone`] -- the actor had stopped; nothing ran.
    /// * [`ExecuteError::ReplyLost`] -- the actor stopped mid-command.
    pub async fn execute(&self, cmd: A::Command, ctx: CommandContext) -> ExecuteResult<A> {
        match self.try_execute(cmd, ctx).await {
            Ok(result) => result,
            Err(_undelivered) => Err(ExecuteError::ActorGone),
        }
    }

    /// Like [`execute`](Self::execute), but hands the command back if the
    /// actor had already stopped so it can be retried on a fresh actor.
    pub(crate) async fn try_execute(
        &self,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<ExecuteResult<A>, (A::Command, CommandContext)> {
        let (tx, rx) = oneshot::channel();
        let msg = ActorMessage::Execute { cmd, ctx, reply: tx };
        if let Err(mpsc::error::SendError(msg)) = self.sender.send(msg).await {
            return match msg {
                ActorMessage::Execute { cmd, ctx, .. } => Err((cmd, ctx)),
                // Only `Execute` was sent above.
                ActorMessage::GetState { .. } | ActorMessage::Shutdown => {
                    Ok(Err(ExecuteError::ActorGone))
                }
            };
        }
        Ok(rx.await.unwrap_or(Err(ExecuteError::ReplyLost)))
    }

    /// Read the current aggregate state.
    ///
    /// Queued behind any commands sent earlier through any handle, so the
    /// result reflects all of them.
    ///
    /// # Errors
    ///
    /// * [`StateError::ActorGone`] -- the actor had stopped.
    /// * [`StateError::ReplyLost`] -- the actor stopped before replying.
    /// * [`StateError::Log`] -- the actor could not recover its state.
    pub async fn state(&self) -> Result<A, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ReplyLost)?
    }

    /// Ask the actor to stop. Commands queued behind the request are
    /// answered with `ActorGone` and never run.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
    }

    /// The instance this handle addresses.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Whether the actor still accepts messages.
    ///
    /// Returns `false` once the actor has begun shutting down (idle
    /// timeout, shutdown request, or failed recovery).
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Whether the actor task has fully returned.
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.has_changed().is_err()
    }

    /// Wait until the actor task has fully returned.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        while stopped.changed().await.is_ok() {}
    }

    /// Resolves once the actor task has returned, without keeping its
    /// mailbox open the way a cloned handle would.
    pub(crate) fn exit_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stopped = self.stopped.clone();
        async move { while stopped.changed().await.is_ok() {} }
    }

    /// Allocation unique to the spawned actor. Two handles address the same
    /// actor iff their tokens are `Arc::ptr_eq`.
    pub(crate) fn actor_token(&self) -> &Arc<str> {
        &self.instance_id
    }
}

/// Spawn an actor for `instance_id` with explicit configuration.
///
/// Returns immediately; replay happens on the actor task before the first
/// queued message is processed.
pub(crate) fn spawn_actor_with_config<A: Aggregate>(
    instance_id: &str,
    log: Arc<dyn EventLog>,
    config: ActorConfig,
) -> AggregateHandle<A> {
    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(config.mailbox_capacity.max(1));
    let (stopped_tx, stopped_rx) = watch::channel(());
    let instance_id: Arc<str> = Arc::from(instance_id);

    let actor = Actor {
        instance_id: Arc::clone(&instance_id),
        log,
        config,
        state: A::default(),
        last_sequence: 0,
    };
    tokio::spawn(async move {
        run_actor(actor, rx).await;
        drop(stopped_tx);
    });

    AggregateHandle {
        sender: tx,
        stopped: stopped_rx,
        instance_id,
    }
}

/// Spawn an actor that never idles out, writing at [`Epoch::ZERO`].
///
/// # Arguments
///
/// * `instance_id` - Stream the actor owns.
/// * `log` - Log to replay from and append to.
///
/// # Returns
///
/// A handle to the running actor. Must be called from within a tokio
/// runtime.
pub fn spawn_actor<A: Aggregate>(instance_id: &str, log: Arc<dyn EventLog>) -> AggregateHandle<A> {
    spawn_actor_with_config(instance_id, log, ActorConfig::default())
}
