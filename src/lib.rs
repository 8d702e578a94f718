//! Event-sourced todo entities.
//!
//! Each todo is owned by its own actor that persists every change as an
//! event before acknowledging it and rebuilds its state by replaying the
//! log. A [`Supervisor`] creates actors lazily and lets idle ones go; a
//! [`Coordinator`] keeps at most one supervisor active across a fleet,
//! fencing stale leaders out at the log.

mod actor;
pub use actor::{AggregateHandle, spawn_actor};
mod aggregate;
pub use aggregate::{Aggregate, replay};
mod command;
mod config;
mod coordinator;
mod error;
mod event;
mod log;
mod storage;
mod store;
mod supervisor;
mod todo;

pub use command::CommandContext;
pub use config::StoreConfig;
pub use coordinator::{Coordinator, Leader, Leadership, RoutingProxy};
pub use error::{DispatchError, ExecuteError, LogError, StateError};
pub use event::{
    EventMetadata, ProposedEvent, RecordedEvent, decode_domain_event, encode_domain_event,
};
pub use log::{Epoch, EventLog, InMemoryLog};
pub use storage::{FileLog, StreamLayout};
pub use store::{AggregateStore, AggregateStoreBuilder};
pub use supervisor::{Command, Reply, Route, Supervisor};
pub use todo::{Todo, TodoCommand, TodoError, TodoEvent, TodoItem};
