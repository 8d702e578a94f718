//! Registry of running aggregate actors.
//!
//! [`AggregateStore`] spawns one actor per `(aggregate type, instance id)`
//! on first use and hands out cached handles afterwards. Actors stop on
//! their own after an idle timeout and their cache entry is dropped as soon
//! as they exit; the next lookup spawns a fresh actor that replays the
//! stream.
//!
//! Open a store with [`AggregateStoreBuilder`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;

use crate::actor::{ActorConfig, AggregateHandle, spawn_actor_with_config};
use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::config::StoreConfig;
use crate::error::{ExecuteError, StateError};
use crate::log::{Epoch, EventLog, InMemoryLog};

/// Type-erased handle cache keyed by `(TypeId, instance_id)`.
///
/// `TypeId` identifies the aggregate type at runtime; the `String` is the
/// instance ID. Each value is an `AggregateHandle<A>` boxed as `dyn Any`
/// together with a type-independent liveness check.
type HandleCache = HashMap<(TypeId, String), CachedHandle>;

struct CachedHandle {
    handle: Box<dyn Any + Send + Sync>,
    aggregate_type: &'static str,
    actor_token: Arc<str>,
    is_alive: fn(&(dyn Any + Send + Sync)) -> bool,
}

impl CachedHandle {
    fn new<A: Aggregate>(handle: AggregateHandle<A>) -> Self {
        Self {
            actor_token: Arc::clone(handle.actor_token()),
            handle: Box::new(handle),
            aggregate_type: A::AGGREGATE_TYPE,
            is_alive: |any: &(dyn Any + Send + Sync)| {
                any.downcast_ref::<AggregateHandle<A>>()
                    .is_some_and(AggregateHandle::<A>::is_alive)
            },
        }
    }

    fn typed<A: Aggregate>(&self) -> Option<&AggregateHandle<A>> {
        self.handle.downcast_ref::<AggregateHandle<A>>()
    }
}

/// Central registry that manages aggregate actor lifecycles.
///
/// Lookups are single-flight: concurrent `get` calls for the same id all
/// receive handles to the same actor, and a replacement actor is never
/// started until its predecessor has fully stopped.
///
/// `Clone` is cheap; all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct AggregateStore {
    cache: Arc<RwLock<HandleCache>>,
    log: Arc<dyn EventLog>,
    config: StoreConfig,
    epoch: Epoch,
}

// Manual `Debug` because `dyn Any` is not `Debug` and we don't want to
// expose cache internals.
impl fmt::Debug for AggregateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateStore")
            .field("epoch", &self.epoch)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AggregateStore {
    /// Start configuring a store.
    pub fn builder() -> AggregateStoreBuilder {
        AggregateStoreBuilder::new()
    }

    /// Get a handle to an aggregate instance, spawning its actor if needed.
    ///
    /// If a live actor is cached, returns a clone of its handle. If the
    /// cached actor is shutting down, waits for it to finish before
    /// spawning the replacement so that two actors never own the same
    /// stream at once.
    ///
    /// # Arguments
    ///
    /// * `id` - Instance id of the aggregate.
    ///
    /// # Returns
    ///
    /// A handle to the live actor for `(A, id)`. The actor replays its
    /// stream before it handles the first message.
    pub async fn get<A: Aggregate>(&self, id: &str) -> AggregateHandle<A> {
        let key = (TypeId::of::<A>(), id.to_owned());

        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(handle) = cache.get(&key).and_then(CachedHandle::typed::<A>)
                && handle.is_alive()
            {
                return handle.clone();
            }
        }

        loop {
            let stopping = {
                let mut cache = self.cache.write().await;
                let existing = cache.get(&key).and_then(CachedHandle::typed::<A>).cloned();
                match existing {
                    Some(handle) if handle.is_alive() => return handle,
                    Some(handle) if !handle.is_stopped() => handle,
                    _ => {
                        let handle = self.spawn::<A>(id);
                        self.evict_on_exit(key.clone(), &handle);
                        cache.insert(key, CachedHandle::new(handle.clone()));
                        return handle;
                    }
                }
            };
            // Previous actor is still draining; wait outside the lock.
            stopping.stopped().await;
        }
    }

    fn spawn<A: Aggregate>(&self, id: &str) -> AggregateHandle<A> {
        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            instance_id = %id,
            epoch = %self.epoch,
            "spawning actor"
        );
        let config = ActorConfig {
            idle_timeout: self.config.idle_timeout,
            mailbox_capacity: self.config.mailbox_capacity,
            epoch: self.epoch,
        };
        spawn_actor_with_config::<A>(id, Arc::clone(&self.log), config)
    }

    /// Remove `key` from the cache once the actor behind `handle` exits,
    /// unless a replacement has taken its slot by then.
    fn evict_on_exit<A: Aggregate>(&self, key: (TypeId, String), handle: &AggregateHandle<A>) {
        let cache: Weak<RwLock<HandleCache>> = Arc::downgrade(&self.cache);
        let token = Arc::clone(handle.actor_token());
        let exited = handle.exit_signal();
        tokio::spawn(async move {
            exited.await;
            let Some(cache) = cache.upgrade() else {
                return;
            };
            let mut cache = cache.write().await;
            let owned = cache
                .get(&key)
                .is_some_and(|cached| Arc::ptr_eq(&cached.actor_token, &token));
            if owned && let Some(cached) = cache.remove(&key) {
                tracing::info!(
                    aggregate_type = cached.aggregate_type,
                    instance_id = %key.1,
                    "actor evicted"
                );
            }
        });
    }

    /// Execute a command against an instance, spawning its actor if needed.
    ///
    /// If the cached actor stopped between lookup and delivery, the command
    /// was never seen by it and is resent once to a fresh actor.
    ///
    /// # Errors
    ///
    /// Same as [`AggregateHandle::execute`].
    pub async fn execute<A: Aggregate>(
        &self,
        id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<Vec<A::DomainEvent>, ExecuteError<A::Error>> {
        let handle = self.get::<A>(id).await;
        let (cmd, ctx) = match handle.try_execute(cmd, ctx).await {
            Ok(result) => return result,
            Err(undelivered) => undelivered,
        };
        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            instance_id = %id,
            "actor stopped before delivery, retrying on a fresh actor"
        );
        self.get::<A>(id).await.execute(cmd, ctx).await
    }

    /// Read the current state of an instance, spawning its actor if needed.
    ///
    /// # Errors
    ///
    /// Same as [`AggregateHandle::state`].
    pub async fn state<A: Aggregate>(&self, id: &str) -> Result<A, StateError> {
        match self.get::<A>(id).await.state().await {
            Err(StateError::ActorGone) => self.get::<A>(id).await.state().await,
            other => other,
        }
    }

    /// Number of cached actors that still accept messages.
    pub async fn live_count(&self) -> usize {
        let cache = self.cache.read().await;
        cache.values().filter(|c| (c.is_alive)(c.handle.as_ref())).count()
    }

    /// Number of entries in the cache, live or not.
    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Drop cache entries whose actors no longer accept messages. Returns how
    /// many were removed.
    ///
    /// Entries normally leave the cache by themselves when their actor
    /// exits. This also sweeps actors that are still draining.
    pub async fn reap(&self) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|(_, instance_id), cached| {
            let alive = (cached.is_alive)(cached.handle.as_ref());
            if !alive {
                tracing::info!(
                    aggregate_type = cached.aggregate_type,
                    instance_id = %instance_id,
                    "actor evicted"
                );
            }
            alive
        });
        before - cache.len()
    }

    /// Stop every cached actor of type `A` and clear them from the cache.
    ///
    /// Commands already queued behind the stop request fail with
    /// [`ExecuteError::ActorGone`].
    pub async fn shutdown<A: Aggregate>(&self) {
        let handles: Vec<AggregateHandle<A>> = {
            let mut cache = self.cache.write().await;
            let keys: Vec<_> = cache
                .keys()
                .filter(|(type_id, _)| *type_id == TypeId::of::<A>())
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| cache.remove(&key))
                .filter_map(|cached| cached.typed::<A>().cloned())
                .collect()
        };
        for handle in &handles {
            handle.shutdown().await;
        }
        for handle in &handles {
            handle.stopped().await;
        }
        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            stopped = handles.len(),
            "actors shut down"
        );
    }

    /// The fencing token stamped on every append made through this store.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The event log shared by every actor of this store.
    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }
}

/// Builder for configuring and opening an [`AggregateStore`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use todo_es::{AggregateStoreBuilder, InMemoryLog};
///
/// let store = AggregateStoreBuilder::new()
///     .log(Arc::new(InMemoryLog::new()))
///     .idle_timeout(Duration::from_secs(60))
///     .open();
/// assert_eq!(store.config().idle_timeout, Duration::from_secs(60));
/// ```
pub struct AggregateStoreBuilder {
    log: Option<Arc<dyn EventLog>>,
    config: StoreConfig,
    epoch: Epoch,
}

impl AggregateStoreBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            log: None,
            config: StoreConfig::default(),
            epoch: Epoch::ZERO,
        }
    }

    /// Set the event log. Defaults to a fresh [`InMemoryLog`].
    pub fn log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the idle timeout after which an actor stops itself.
    ///
    /// The next [`get`](AggregateStore::get) call transparently re-spawns
    /// the actor from the log. Defaults to 10 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the capacity of each actor's queue.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity;
        self
    }

    /// Set the fencing token stamped on every append.
    pub fn epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = epoch;
        self
    }

    /// Build the [`AggregateStore`]. No actor is spawned until first use.
    pub fn open(self) -> AggregateStore {
        AggregateStore {
            cache: Arc::new(RwLock::new(HashMap::new())),
            log: self.log.unwrap_or_else(|| Arc::new(InMemoryLog::new())),
            config: self.config,
            epoch: self.epoch,
        }
    }
}

impl Default for AggregateStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::todo::{Todo, TodoCommand, TodoError};

    fn create(title: &str) -> TodoCommand {
        TodoCommand::Create {
            title: title.into(),
            description: None,
        }
    }

    fn store_with_timeout(log: Arc<InMemoryLog>, idle: Duration) -> AggregateStore {
        AggregateStoreBuilder::new()
            .log(log)
            .idle_timeout(idle)
            .open()
    }

    #[tokio::test]
    async fn get_twice_returns_same_actor() {
        let store = AggregateStoreBuilder::new().open();
        let h1 = store.get::<Todo>("t-1").await;
        h1.execute(create("A"), CommandContext::default())
            .await
            .expect("create should succeed");

        let h2 = store.get::<Todo>("t-1").await;
        assert!(h2.is_alive());
        assert_eq!(store.live_count().await, 1);
        h1.shutdown().await;
        h1.stopped().await;
        assert!(!h2.is_alive(), "both handles address one actor");
    }

    #[tokio::test]
    async fn concurrent_gets_spawn_a_single_actor() {
        let store = AggregateStoreBuilder::new().open();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.get::<Todo>("t-1").await }));
        }
        for task in tasks {
            task.await.expect("task should not panic");
        }
        assert_eq!(store.live_count().await, 1);
    }

    #[tokio::test]
    async fn execute_through_store_persists() {
        let log = Arc::new(InMemoryLog::new());
        let store = AggregateStoreBuilder::new().log(log.clone()).open();

        store
            .execute::<Todo>("t-1", create("A"), CommandContext::default())
            .await
            .expect("create should succeed");
        let err = store
            .execute::<Todo>("t-2", TodoCommand::Complete, CommandContext::default())
            .await
            .expect_err("t-2 does not exist");
        assert!(matches!(err, ExecuteError::Domain(TodoError::NotFound)));

        assert_eq!(log.len("todo", "t-1"), 1);
        assert_eq!(log.len("todo", "t-2"), 0);
    }

    #[tokio::test]
    async fn idle_actor_is_replaced_transparently() {
        let log = Arc::new(InMemoryLog::new());
        let store = store_with_timeout(log.clone(), Duration::from_millis(100));

        store
            .execute::<Todo>("t-1", create("A"), CommandContext::default())
            .await
            .expect("create should succeed");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.live_count().await, 0);

        let state = store.state::<Todo>("t-1").await.expect("state");
        assert_eq!(state.item().map(|i| i.title.as_str()), Some("A"));
        assert_eq!(store.live_count().await, 1);
    }

    #[tokio::test]
    async fn stale_handle_command_is_retried_once() {
        let log = Arc::new(InMemoryLog::new());
        let store = AggregateStoreBuilder::new().log(log.clone()).open();
        let handle = store.get::<Todo>("t-1").await;
        handle.shutdown().await;
        handle.stopped().await;

        store
            .execute::<Todo>("t-1", create("A"), CommandContext::default())
            .await
            .expect("store should respawn and deliver");
        assert_eq!(log.len("todo", "t-1"), 1);
    }

    #[tokio::test]
    async fn stopped_actors_leave_the_cache() {
        let store = store_with_timeout(Arc::new(InMemoryLog::new()), Duration::from_millis(50));
        for i in 0..64 {
            store.get::<Todo>(&format!("t-{i}")).await;
        }
        assert_eq!(store.cached_count().await, 64);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.cached_count().await, 0);
        assert_eq!(store.reap().await, 0);
    }

    #[tokio::test]
    async fn exit_of_old_actor_keeps_its_replacement() {
        let store = AggregateStoreBuilder::new().open();
        let old = store.get::<Todo>("t-1").await;
        old.shutdown().await;
        old.stopped().await;

        let fresh = store.get::<Todo>("t-1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fresh.is_alive());
        assert_eq!(store.cached_count().await, 1);
        assert_eq!(store.live_count().await, 1);
    }

    #[tokio::test]
    async fn reap_sweeps_draining_actors() {
        let store = AggregateStoreBuilder::new().open();
        let handle = store.get::<Todo>("a").await;
        store.get::<Todo>("b").await;
        handle.shutdown().await;
        handle.stopped().await;

        // The exit watcher may already have removed "a".
        let removed = store.reap().await;
        assert!(removed <= 1);
        assert_eq!(store.cached_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_every_actor_of_a_type() {
        let store = AggregateStoreBuilder::new().open();
        let a = store.get::<Todo>("a").await;
        let b = store.get::<Todo>("b").await;

        store.shutdown::<Todo>().await;
        assert!(!a.is_alive());
        assert!(!b.is_alive());
        assert_eq!(store.live_count().await, 0);
    }

    #[tokio::test]
    async fn builder_applies_configuration() {
        let store = AggregateStoreBuilder::new()
            .mailbox_capacity(4)
            .epoch(Epoch::new(7))
            .open();
        assert_eq!(store.config().mailbox_capacity, 4);
        assert_eq!(store.epoch(), Epoch::new(7));
    }
}
