//! Command routing for todo entities.
//!
//! [`Supervisor`] turns a [`Command`] addressed to an entity id into a
//! call on that entity's actor and maps the outcome onto a [`Reply`]. It
//! holds no durable state: dropping it and building a new one over the
//! same log loses nothing, the registry just refills on demand.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::CommandContext;
use crate::config::StoreConfig;
use crate::error::{DispatchError, ExecuteError, StateError};
use crate::log::{Epoch, EventLog};
use crate::store::{AggregateStore, AggregateStoreBuilder};
use crate::todo::{Todo, TodoCommand, TodoError};

/// A request to change or read one todo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Command {
    Create {
        id: String,
        title: String,
        #[serde(default)]
        description: Option<String>,
    },
    Update {
        id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Complete {
        id: String,
    },
    Delete {
        id: String,
    },
    Get {
        id: String,
    },
}

impl Command {
    /// A `Create` for a freshly generated id.
    ///
    /// # Arguments
    ///
    /// * `title` - Title of the new todo.
    /// * `description` - Optional longer text.
    ///
    /// # Returns
    ///
    /// `Command::Create` with a random UUID v4 as its id. Read it back with
    /// [`id`](Command::id) to address the todo later.
    ///
    /// # Examples
    ///
    /// ```
    /// use todo_es::Command;
    ///
    /// let a = Command::create("Buy milk", None);
    /// let b = Command::create("Buy milk", None);
    /// assert_ne!(a.id(), b.id());
    /// ```
    pub fn create(title: impl Into<String>, description: Option<String>) -> Self {
        Self::Create {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description,
        }
    }

    /// The entity this command addresses.
    pub fn id(&self) -> &str {
        match self {
            Self::Create { id, .. }
            | Self::Update { id, .. }
            | Self::Complete { id }
            | Self::Delete { id }
            | Self::Get { id } => id,
        }
    }

    /// Split into the entity id and the aggregate command. `Get` has no
    /// aggregate command; it is served from state.
    fn into_parts(self) -> (String, Option<TodoCommand>) {
        match self {
            Self::Create {
                id,
                title,
                description,
            } => (id, Some(TodoCommand::Create { title, description })),
            Self::Update {
                id,
                title,
                description,
            } => (id, Some(TodoCommand::Update { title, description })),
            Self::Complete { id } => (id, Some(TodoCommand::Complete)),
            Self::Delete { id } => (id, Some(TodoCommand::Delete)),
            Self::Get { id } => (id, None),
        }
    }
}

/// The outcome of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Reply {
    /// The command was accepted; any event it produced is durable.
    Ack { id: String },
    /// The entity does not exist. Nothing was written.
    NotFound { id: String },
    /// Current state of an existing entity.
    Snapshot {
        id: String,
        title: String,
        description: Option<String>,
        completed: bool,
    },
}

impl Reply {
    /// The entity this reply is about.
    pub fn id(&self) -> &str {
        match self {
            Self::Ack { id } | Self::NotFound { id } | Self::Snapshot { id, .. } => id,
        }
    }

    /// `Ack` and `Snapshot` map to success at the transport boundary.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ack { .. } | Self::Snapshot { .. })
    }

    /// Whether the transport should answer "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Something that can carry a [`Command`] to the active supervisor.
///
/// Implemented by [`Supervisor`] itself, by
/// [`Coordinator`](crate::Coordinator) and by
/// [`RoutingProxy`](crate::RoutingProxy).
#[async_trait]
pub trait Route: Send + Sync + 'static {
    /// Route one command and wait for its reply.
    async fn dispatch(&self, command: Command) -> Result<Reply, DispatchError>;

    /// Like [`dispatch`](Route::dispatch), but give up after `timeout`.
    ///
    /// Giving up does not cancel the command: if it already reached its
    /// actor it still runs and may still be persisted.
    async fn ask(&self, command: Command, timeout: Duration) -> Result<Reply, DispatchError> {
        match tokio::time::timeout(timeout, self.dispatch(command)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(?timeout, "ask timed out");
                Err(DispatchError::Timeout(timeout))
            }
        }
    }
}

/// Routes todo commands to per-entity actors.
///
/// `Clone` is cheap; clones share one registry.
#[derive(Debug, Clone)]
pub struct Supervisor {
    store: AggregateStore,
}

impl Supervisor {
    /// Build a supervisor with an empty registry over `log`, writing at
    /// `epoch`.
    ///
    /// # Arguments
    ///
    /// * `log` - Shared event log every actor appends to and replays from.
    /// * `config` - Idle timeout and mailbox size for the actors.
    /// * `epoch` - Fencing token stamped on every append. A log fenced at a
    ///   newer epoch rejects them.
    pub fn new(log: Arc<dyn EventLog>, config: StoreConfig, epoch: Epoch) -> Self {
        let store = AggregateStoreBuilder::new()
            .log(log)
            .config(config)
            .epoch(epoch)
            .open();
        Self { store }
    }

    /// Wrap an existing store.
    pub fn from_store(store: AggregateStore) -> Self {
        Self { store }
    }

    /// The underlying actor registry.
    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    /// The fencing token this supervisor writes with.
    pub fn epoch(&self) -> Epoch {
        self.store.epoch()
    }

    /// Route `command` to its entity with an empty [`CommandContext`].
    ///
    /// # Errors
    ///
    /// See [`dispatch_with`](Self::dispatch_with).
    pub async fn dispatch(&self, command: Command) -> Result<Reply, DispatchError> {
        self.dispatch_with(command, CommandContext::default()).await
    }

    /// Route `command` to its entity, stamping `ctx` into any event it
    /// produces.
    ///
    /// The actor's answer is relayed as is. Nothing is retried once the
    /// actor has accepted the command.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::Persistence`] -- the event could not be appended,
    ///   including appends rejected for a stale epoch.
    /// * [`DispatchError::Unavailable`] -- the actor stopped mid-command.
    pub async fn dispatch_with(
        &self,
        command: Command,
        ctx: CommandContext,
    ) -> Result<Reply, DispatchError> {
        let (id, cmd) = command.into_parts();
        let Some(cmd) = cmd else {
            return self.snapshot(id).await;
        };

        match self.store.execute::<Todo>(&id, cmd, ctx).await {
            Ok(_) => Ok(Reply::Ack { id }),
            Err(ExecuteError::Domain(TodoError::NotFound)) => Ok(Reply::NotFound { id }),
            Err(ExecuteError::Log(e)) => Err(DispatchError::Persistence(e)),
            Err(e @ (ExecuteError::ActorGone | ExecuteError::ReplyLost)) => {
                tracing::error!(instance_id = %id, error = %e, "command lost in routing");
                Err(DispatchError::Unavailable(e.to_string()))
            }
        }
    }

    async fn snapshot(&self, id: String) -> Result<Reply, DispatchError> {
        match self.store.state::<Todo>(&id).await {
            Ok(Todo::Active(item)) => Ok(Reply::Snapshot {
                id,
                title: item.title,
                description: item.description,
                completed: item.completed,
            }),
            Ok(Todo::Absent) => Ok(Reply::NotFound { id }),
            Err(StateError::Log(e)) => Err(DispatchError::Persistence(e)),
            Err(e) => Err(DispatchError::Unavailable(e.to_string())),
        }
    }

    /// Stop every actor this supervisor started.
    pub async fn shutdown(&self) {
        self.store.shutdown::<Todo>().await;
    }
}

#[async_trait]
impl Route for Supervisor {
    async fn dispatch(&self, command: Command) -> Result<Reply, DispatchError> {
        Supervisor::dispatch(self, command).await
    }
}
