//! Tunables for the store, its workers and the routing layer.

use std::time::Duration;

/// Runtime configuration shared by [`AggregateStore`](crate::AggregateStore),
/// [`Supervisor`](crate::Supervisor) and [`RoutingProxy`](crate::RoutingProxy).
///
/// All fields have defaults accessible via [`StoreConfig::default()`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use todo_es::StoreConfig;
///
/// let config = StoreConfig {
///     idle_timeout: Duration::from_secs(30),
///     ..StoreConfig::default()
/// };
/// assert_eq!(config.idle_timeout, Duration::from_secs(30));
/// assert_eq!(config.ask_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long a worker waits without receiving a message before it stops
    /// itself. Its state is rebuilt from the log on next use.
    ///
    /// Default: 10 minutes.
    pub idle_timeout: Duration,

    /// Capacity of each worker's queue. Senders wait once it is full.
    ///
    /// Default: 32.
    pub mailbox_capacity: usize,

    /// How long [`RoutingProxy::request`](crate::RoutingProxy::request)
    /// waits for a reply before giving up. The command itself is not
    /// cancelled. Callers of [`Route::ask`](crate::Route::ask) pass their
    /// own bound.
    ///
    /// Default: 5 seconds.
    pub ask_timeout: Duration,

    /// How long a [`RoutingProxy`](crate::RoutingProxy) holds a command
    /// while no active supervisor is known.
    ///
    /// Default: 3 seconds.
    pub handover_window: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            mailbox_capacity: 32,
            ask_timeout: Duration::from_secs(5),
            handover_window: Duration::from_secs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.mailbox_capacity, 32);
        assert_eq!(config.ask_timeout, Duration::from_secs(5));
        assert_eq!(config.handover_window, Duration::from_secs(3));
    }
}
