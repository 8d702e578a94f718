//! Singleton coordination: at most one active supervisor per fleet.
//!
//! Leader election itself lives outside this crate. The election layer
//! calls [`Coordinator::on_promotion`] with a fresh fencing [`Epoch`] on the
//! node that won and [`Coordinator::on_demotion`] on the node that lost.
//! Promotion raises the log's fence before the new supervisor accepts
//! traffic, so a demoted node that still believes it leads cannot append.
//!
//! Every node routes through a [`RoutingProxy`], which follows the
//! [`Leadership`] channel to whichever node is currently active and holds
//! commands for up to a handover window while nobody is.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::StoreConfig;
use crate::error::{DispatchError, LogError};
use crate::log::{Epoch, EventLog};
use crate::supervisor::{Command, Reply, Route, Supervisor};

/// The currently active node as seen by the fleet.
#[derive(Clone)]
pub struct Leader {
    /// Name of the node hosting the active supervisor.
    pub node: String,
    /// Epoch the node was promoted with.
    pub epoch: Epoch,
    /// Does not keep the node alive; a dropped coordinator reads as
    /// stepped down.
    route: Weak<dyn Route>,
}

impl fmt::Debug for Leader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leader")
            .field("node", &self.node)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Shared view of who leads, published by coordinators and followed by
/// proxies.
///
/// Stands in for the membership service's gossip in a single process;
/// clones share one channel.
#[derive(Clone)]
pub struct Leadership {
    tx: Arc<watch::Sender<Option<Leader>>>,
}

impl Leadership {
    /// A channel with no leader.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// The current leader, if any.
    pub fn current(&self) -> Option<Leader> {
        self.tx.borrow().clone()
    }

    /// Follow leadership changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Leader>> {
        self.tx.subscribe()
    }

    /// Announce `leader`, unless a leader with a newer epoch is already
    /// known.
    fn publish(&self, leader: Leader) {
        self.tx.send_if_modified(|current| match current {
            Some(existing) if existing.epoch > leader.epoch => false,
            _ => {
                *current = Some(leader);
                true
            }
        });
    }

    /// Clear the leader if it is still `node`.
    fn withdraw(&self, node: &str) {
        self.tx.send_if_modified(|current| {
            if current.as_ref().is_some_and(|l| l.node == node) {
                *current = None;
                true
            } else {
                false
            }
        });
    }
}

impl Default for Leadership {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Leadership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leadership")
            .field("current", &*self.tx.borrow())
            .finish()
    }
}

struct CoordinatorInner {
    node: String,
    log: Arc<dyn EventLog>,
    config: StoreConfig,
    leadership: Leadership,
    active: RwLock<Option<Supervisor>>,
}

impl CoordinatorInner {
    fn active(&self) -> Option<Supervisor> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Route for CoordinatorInner {
    /// Serve locally while active; refuse otherwise.
    async fn dispatch(&self, command: Command) -> Result<Reply, DispatchError> {
        match self.active() {
            Some(supervisor) => supervisor.dispatch(command).await,
            None => Err(DispatchError::NotActive),
        }
    }
}

/// One node's seat in the singleton election.
///
/// Hosts a [`Supervisor`] only while promoted. `Clone` is cheap.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("node", &self.inner.node)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Coordinator {
    /// A follower seat for `node`.
    ///
    /// # Arguments
    ///
    /// * `node` - Name announced on [`Leadership`] once promoted.
    /// * `log` - The log every node of the fleet writes to.
    /// * `config` - Settings for the supervisor and for [`proxy`](Self::proxy).
    /// * `leadership` - Channel shared with every other node.
    pub fn new(
        node: impl Into<String>,
        log: Arc<dyn EventLog>,
        config: StoreConfig,
        leadership: Leadership,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                node: node.into(),
                log,
                config,
                leadership,
                active: RwLock::new(None),
            }),
        }
    }

    /// This node's name.
    pub fn node(&self) -> &str {
        &self.inner.node
    }

    /// Whether this node currently hosts the active supervisor.
    pub fn is_active(&self) -> bool {
        self.inner.active().is_some()
    }

    /// The hosted supervisor, while active.
    pub fn supervisor(&self) -> Option<Supervisor> {
        self.inner.active()
    }

    /// Take over as the active node.
    ///
    /// Fences the log at `epoch`, then starts a supervisor with an empty
    /// registry and announces this node as leader. Entities are recreated
    /// from the log as they are referenced.
    ///
    /// # Arguments
    ///
    /// * `epoch` - Fencing token from the election. Must not be older than
    ///   any epoch the log has already seen.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::StaleEpoch`] if the log has already been fenced
    /// by a newer leader; the node stays a follower.
    pub async fn on_promotion(&self, epoch: Epoch) -> Result<(), LogError> {
        self.inner.log.fence(epoch).await?;

        let supervisor = Supervisor::new(
            Arc::clone(&self.inner.log),
            self.inner.config.clone(),
            epoch,
        );
        let previous = self
            .inner
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(supervisor);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        let weak: Weak<CoordinatorInner> = Arc::downgrade(&self.inner);
        let route: Weak<dyn Route> = weak;
        self.inner.leadership.publish(Leader {
            node: self.inner.node.clone(),
            epoch,
            route,
        });
        tracing::info!(node = %self.inner.node, %epoch, "promoted to active supervisor");
        Ok(())
    }

    /// Step down: stop routing and drop the supervisor.
    ///
    /// Commands queued at this node's actors are answered with an error;
    /// any already persisted stay persisted.
    pub async fn on_demotion(&self) {
        let previous = self
            .inner
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.leadership.withdraw(&self.inner.node);

        if let Some(previous) = previous {
            previous.shutdown().await;
            tracing::info!(
                node = %self.inner.node,
                epoch = %previous.epoch(),
                "demoted, supervisor stopped"
            );
        }
    }

    /// A proxy that routes through the shared [`Leadership`] channel,
    /// using this node's handover window and ask timeout.
    pub fn proxy(&self) -> RoutingProxy {
        RoutingProxy::new(&self.inner.leadership, self.inner.config.handover_window)
            .with_ask_timeout(self.inner.config.ask_timeout)
    }
}

#[async_trait]
impl Route for Coordinator {
    /// Serve locally while active; refuse otherwise.
    async fn dispatch(&self, command: Command) -> Result<Reply, DispatchError> {
        self.inner.dispatch(command).await
    }
}

/// Forwards commands to the active supervisor, wherever it runs.
///
/// While no leader is known, or the known one answers
/// [`DispatchError::NotActive`], the command is held until a new leader
/// appears or the handover window elapses.
#[derive(Debug, Clone)]
pub struct RoutingProxy {
    leadership: watch::Receiver<Option<Leader>>,
    handover_window: Duration,
    ask_timeout: Duration,
}

impl RoutingProxy {
    /// Follow `leadership`, buffering for at most `handover_window`.
    ///
    /// [`request`](Self::request) waits for the default
    /// [`StoreConfig::ask_timeout`] unless overridden with
    /// [`with_ask_timeout`](Self::with_ask_timeout).
    pub fn new(leadership: &Leadership, handover_window: Duration) -> Self {
        Self {
            leadership: leadership.subscribe(),
            handover_window,
            ask_timeout: StoreConfig::default().ask_timeout,
        }
    }

    /// Set how long [`request`](Self::request) waits for a reply.
    pub fn with_ask_timeout(mut self, ask_timeout: Duration) -> Self {
        self.ask_timeout = ask_timeout;
        self
    }

    /// How long [`request`](Self::request) waits for a reply.
    pub fn ask_timeout(&self) -> Duration {
        self.ask_timeout
    }

    /// Route `command` and wait at most [`ask_timeout`](Self::ask_timeout)
    /// for the reply, the way a gateway answers its callers.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Timeout`] once the ask timeout elapses, otherwise
    /// whatever [`dispatch`](Route::dispatch) returns. The timeout does not
    /// cancel a command that already reached the leader.
    pub async fn request(&self, command: Command) -> Result<Reply, DispatchError> {
        self.ask(command, self.ask_timeout).await
    }
}

#[async_trait]
impl Route for RoutingProxy {
    async fn dispatch(&self, command: Command) -> Result<Reply, DispatchError> {
        let deadline = tokio::time::Instant::now() + self.handover_window;
        let mut leadership = self.leadership.clone();

        loop {
            let leader = leadership.borrow_and_update().clone();
            let route = leader.as_ref().and_then(|l| l.route.upgrade());
            if let (Some(leader), Some(route)) = (&leader, route) {
                match route.dispatch(command.clone()).await {
                    // Refused without effect; safe to try the next leader.
                    Err(DispatchError::NotActive) => {
                        tracing::debug!(node = %leader.node, "leader stepped down, waiting for handover");
                    }
                    other => return other,
                }
            } else if let Some(leader) = &leader {
                tracing::debug!(node = %leader.node, "announced leader is gone, waiting for handover");
            }

            match tokio::time::timeout_at(deadline, leadership.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_closed)) => {
                    return Err(DispatchError::Unavailable(
                        "leadership channel closed".to_owned(),
                    ));
                }
                Err(_elapsed) => {
                    tracing::warn!(window = ?self.handover_window, "no active supervisor");
                    return Err(DispatchError::NoLeader(self.handover_window));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLog;

    fn config() -> StoreConfig {
        StoreConfig {
            handover_window: Duration::from_millis(500),
            ..StoreConfig::default()
        }
    }

    fn fleet(log: &Arc<InMemoryLog>) -> (Leadership, Coordinator, Coordinator) {
        let leadership = Leadership::new();
        let a = Coordinator::new("a", log.clone(), config(), leadership.clone());
        let b = Coordinator::new("b", log.clone(), config(), leadership.clone());
        (leadership, a, b)
    }

    #[tokio::test]
    async fn follower_refuses_commands() {
        let log = Arc::new(InMemoryLog::new());
        let (_, a, _) = fleet(&log);
        assert!(!a.is_active());
        let err = Route::dispatch(&a, Command::Get { id: "x".into() })
            .await
            .expect_err("follower must refuse");
        assert!(matches!(err, DispatchError::NotActive));
    }

    #[tokio::test]
    async fn promotion_fences_log_and_announces_leader() {
        let log = Arc::new(InMemoryLog::new());
        let (leadership, a, _) = fleet(&log);

        a.on_promotion(Epoch::new(1)).await.expect("promotion");
        assert!(a.is_active());
        assert_eq!(log.current_epoch().await.expect("epoch"), Epoch::new(1));
        let leader = leadership.current().expect("leader should be known");
        assert_eq!(leader.node, "a");
        assert_eq!(leader.epoch, Epoch::new(1));
    }

    #[tokio::test]
    async fn failover_rebuilds_state_from_log() {
        let log = Arc::new(InMemoryLog::new());
        let (_, a, b) = fleet(&log);
        let proxy = b.proxy();

        a.on_promotion(Epoch::new(1)).await.expect("promotion");
        let create = Command::create("Buy milk", None);
        let id = create.id().to_owned();
        let reply = proxy.dispatch(create).await.expect("create via proxy");
        assert_eq!(reply, Reply::Ack { id: id.clone() });

        a.on_demotion().await;
        assert!(!a.is_active());
        b.on_promotion(Epoch::new(2)).await.expect("promotion");

        let reply = proxy.dispatch(Command::Get { id: id.clone() }).await.expect("get");
        assert_eq!(
            reply,
            Reply::Snapshot {
                id,
                title: "Buy milk".into(),
                description: None,
                completed: false,
            }
        );
    }

    #[tokio::test]
    async fn proxy_buffers_during_handover() {
        let log = Arc::new(InMemoryLog::new());
        let (_, a, b) = fleet(&log);
        let proxy = a.proxy();

        let pending = tokio::spawn(async move { proxy.dispatch(Command::create("A", None)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        b.on_promotion(Epoch::new(1)).await.expect("promotion");

        let reply = pending
            .await
            .expect("task should not panic")
            .expect("buffered command should reach the new leader");
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn proxy_gives_up_after_handover_window() {
        let log = Arc::new(InMemoryLog::new());
        let (_, a, _) = fleet(&log);

        let err = a
            .proxy()
            .dispatch(Command::Get { id: "x".into() })
            .await
            .expect_err("no leader ever appears");
        assert!(matches!(err, DispatchError::NoLeader(_)));
    }

    #[tokio::test]
    async fn request_uses_the_configured_ask_timeout() {
        let log = Arc::new(InMemoryLog::new());
        let leadership = Leadership::new();
        let config = StoreConfig {
            ask_timeout: Duration::from_millis(50),
            ..config()
        };
        let a = Coordinator::new("a", log.clone(), config, leadership);
        let proxy = a.proxy();
        assert_eq!(proxy.ask_timeout(), Duration::from_millis(50));

        let err = proxy
            .request(Command::Get { id: "x".into() })
            .await
            .expect_err("no leader within the ask timeout");
        assert!(matches!(err, DispatchError::Timeout(d) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn announced_leader_does_not_keep_its_coordinator_alive() {
        let log = Arc::new(InMemoryLog::new());
        let (leadership, a, b) = fleet(&log);
        let proxy = b.proxy();

        a.on_promotion(Epoch::new(1)).await.expect("promotion");
        let seat = Arc::downgrade(&a.inner);
        drop(a);

        assert!(seat.upgrade().is_none(), "leadership must not own the node");
        assert_eq!(leadership.current().map(|l| l.node), Some("a".to_owned()));
        let err = proxy
            .dispatch(Command::Get { id: "x".into() })
            .await
            .expect_err("a dropped leader cannot serve");
        assert!(matches!(err, DispatchError::NoLeader(_)));
    }

    #[tokio::test]
    async fn split_brain_writer_is_fenced_out() {
        let log = Arc::new(InMemoryLog::new());
        let (_, a, b) = fleet(&log);

        a.on_promotion(Epoch::new(1)).await.expect("promotion");
        // b wins a newer election before a learns it lost.
        b.on_promotion(Epoch::new(2)).await.expect("promotion");
        assert!(a.is_active(), "a has not been told yet");

        let err = Route::dispatch(&a, Command::create("stale", None))
            .await
            .expect_err("stale leader must not persist");
        assert!(matches!(
            err,
            DispatchError::Persistence(LogError::StaleEpoch { .. })
        ));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn stale_promotion_is_rejected() {
        let log = Arc::new(InMemoryLog::new());
        let (leadership, a, b) = fleet(&log);

        b.on_promotion(Epoch::new(5)).await.expect("promotion");
        let err = a
            .on_promotion(Epoch::new(4))
            .await
            .expect_err("older epoch must lose");
        assert!(matches!(err, LogError::StaleEpoch { .. }));
        assert!(!a.is_active());
        assert_eq!(leadership.current().map(|l| l.node), Some("b".to_owned()));
    }

    #[tokio::test]
    async fn demotion_of_old_leader_keeps_new_announcement() {
        let log = Arc::new(InMemoryLog::new());
        let (leadership, a, b) = fleet(&log);

        a.on_promotion(Epoch::new(1)).await.expect("promotion");
        b.on_promotion(Epoch::new(2)).await.expect("promotion");
        a.on_demotion().await;

        assert_eq!(leadership.current().map(|l| l.node), Some("b".to_owned()));
    }
}
