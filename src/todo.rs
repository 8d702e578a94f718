//! Todo aggregate: the per-entity state machine.
//!
//! A todo is either absent (never created, or deleted) or active with a
//! title, an optional description and a completion flag.

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Fields of a todo that exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    /// Short title.
    pub title: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Whether the todo has been completed.
    pub completed: bool,
}

/// Aggregate state of one todo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Todo {
    /// No `Created` event applied yet, or the todo was deleted.
    #[default]
    Absent,
    /// The todo exists.
    Active(TodoItem),
}

impl Todo {
    /// The todo's fields, or `None` while absent.
    pub fn item(&self) -> Option<&TodoItem> {
        match self {
            Self::Absent => None,
            Self::Active(item) => Some(item),
        }
    }

    /// Whether the todo currently exists.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands accepted by the [`Todo`] aggregate.
///
/// Reads are not commands: they go through
/// [`AggregateHandle::state`](crate::AggregateHandle::state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TodoCommand {
    /// Create the todo. Acknowledged without effect if it already exists.
    Create {
        title: String,
        description: Option<String>,
    },
    /// Change the title and/or description. `None` keeps the current value.
    Update {
        title: Option<String>,
        description: Option<String>,
    },
    /// Mark the todo as done.
    Complete,
    /// Remove the todo.
    Delete,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Domain events produced by the [`Todo`] aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TodoEvent {
    /// The todo was created.
    Created {
        title: String,
        description: Option<String>,
    },
    /// Some fields changed. `None` fields were left untouched.
    Updated {
        title: Option<String>,
        description: Option<String>,
    },
    /// The todo was marked as done.
    Completed,
    /// The todo was removed.
    Deleted,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur when handling a [`TodoCommand`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TodoError {
    /// The command targets a todo that does not exist.
    #[error("todo does not exist")]
    NotFound,
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for Todo {
    const AGGREGATE_TYPE: &'static str = "todo";
    type Command = TodoCommand;
    type DomainEvent = TodoEvent;
    type Error = TodoError;

    fn handle(&self, cmd: TodoCommand) -> Result<Vec<TodoEvent>, TodoError> {
        match (self, cmd) {
            (Self::Absent, TodoCommand::Create { title, description }) => {
                Ok(vec![TodoEvent::Created { title, description }])
            }
            // Repeated create is idempotent: the first title wins.
            (Self::Active(_), TodoCommand::Create { .. }) => Ok(vec![]),
            (Self::Absent, _) => Err(TodoError::NotFound),
            (Self::Active(_), TodoCommand::Update { title, description }) => {
                Ok(vec![TodoEvent::Updated { title, description }])
            }
            (Self::Active(_), TodoCommand::Complete) => Ok(vec![TodoEvent::Completed]),
            (Self::Active(_), TodoCommand::Delete) => Ok(vec![TodoEvent::Deleted]),
        }
    }

    fn apply(self, event: &TodoEvent) -> Self {
        match (self, event) {
            (_, TodoEvent::Created { title, description }) => Self::Active(TodoItem {
                title: title.clone(),
                description: description.clone(),
                completed: false,
            }),
            (Self::Active(mut item), TodoEvent::Updated { title, description }) => {
                if let Some(title) = title {
                    item.title = title.clone();
                }
                if description.is_some() {
                    item.description = description.clone();
                }
                Self::Active(item)
            }
            (Self::Active(mut item), TodoEvent::Completed) => {
                item.completed = true;
                Self::Active(item)
            }
            (_, TodoEvent::Deleted) => Self::Absent,
            // Updates and completions of an absent todo are never emitted;
            // ignore them if a foreign writer produced one.
            (Self::Absent, TodoEvent::Updated { .. } | TodoEvent::Completed) => Self::Absent,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
