//! Cross-cutting context carried alongside every command.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who issued a command and which request it belongs to.
///
/// The context never influences a decision; it is stamped onto the
/// [`EventMetadata`](crate::EventMetadata) of every event the command
/// produces so the durable log keeps an audit trail.
///
/// # Examples
///
/// ```
/// use todo_es::CommandContext;
/// use serde_json::json;
///
/// let ctx = CommandContext::default()
///     .with_actor("gateway")
///     .with_correlation_id("req-7")
///     .with_metadata(json!({"verb": "POST"}));
///
/// assert_eq!(ctx.actor.as_deref(), Some("gateway"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-7"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the caller (a user id or service name).
    pub actor: Option<String>,
    /// Request id used to correlate log lines and events.
    pub correlation_id: Option<String>,
    /// Free-form metadata copied into the event record.
    pub metadata: Option<Value>,
}

impl CommandContext {
    /// Set the caller identity.
    ///
    /// # Arguments
    ///
    /// * `actor` - Who issued the command, e.g. a user id or a service name.
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` with the actor set.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation id.
    ///
    /// # Arguments
    ///
    /// * `id` - Request id shared by every event and log line the command
    ///   produces.
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` with the correlation id set.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach free-form metadata. Only JSON objects are merged into the
    /// stored record; other values are kept under a `"context"` key.
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }
}
