//! Connection ladder - dependent resource levels climbed through a shared cache
//!
//! A ladder is a tree of levels (for example connection → channel → queue).
//! Climbing walks the tree in pre-order, acquiring each level from the
//! [`ResourceCache`]. A level that fails to create, closes, or errors is
//! cleared and the whole ladder is climbed again after a fixed delay, with
//! already-ready levels reused.

use crate::core::config::LadderSettings;
use crate::resource::{
    cache::{Acquired, Deleter, ResourceCache, Setter},
    ResourceError,
};
use async_trait::async_trait;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

/// Conversion of a shared resource into `Any` for downcasting
pub trait AsAny: Any + Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Event reported by a resource after it was handed out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Closed(Option<String>),
    Failed(String),
}

pub type LifecycleListener = Box<dyn Fn(Lifecycle) + Send + Sync>;

/// Set once listeners have been attached to a resource
#[derive(Debug, Default)]
pub struct ListenerGuard(AtomicBool);

impl ListenerGuard {
    /// Returns `true` only for the first caller
    pub fn arm(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A value a ladder level produces
pub trait Resource: AsAny {
    /// Register a listener for close and error events
    fn subscribe(&self, listener: LifecycleListener);

    fn listener_guard(&self) -> &ListenerGuard;
}

/// Listener list a resource can embed to implement [`Resource::subscribe`]
#[derive(Default)]
pub struct Listeners {
    listeners: Mutex<Vec<LifecycleListener>>,
}

impl Listeners {
    pub fn subscribe(&self, listener: LifecycleListener) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    pub fn emit(&self, event: Lifecycle) {
        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.iter() {
                listener(event.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}

/// Resource for a level that only declares something (a table, an exchange)
#[derive(Debug, Default)]
pub struct Declared {
    name: String,
    guard: ListenerGuard,
}

impl Declared {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            guard: ListenerGuard::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Resource for Declared {
    fn subscribe(&self, _listener: LifecycleListener) {}

    fn listener_guard(&self) -> &ListenerGuard {
        &self.guard
    }
}

/// Resolved resources of a climb, keyed by level key
#[derive(Clone, Default)]
pub struct Rungs {
    by_key: HashMap<String, Arc<dyn Resource>>,
}

impl Rungs {
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.by_key
            .get(key)
            .cloned()
            .and_then(|resource| resource.into_any().downcast::<T>().ok())
    }

    /// Like [`Rungs::get`] but an error when the level is missing or of another type
    pub fn require<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, ResourceError> {
        self.get(key)
            .ok_or_else(|| ResourceError::Failed(format!("level {} is not available", key)))
    }

    pub fn raw(&self, key: &str) -> Option<Arc<dyn Resource>> {
        self.by_key.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn insert(&mut self, key: String, resource: Arc<dyn Resource>) {
        self.by_key.insert(key, resource);
    }
}

impl fmt::Debug for Rungs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.by_key.keys().collect();
        keys.sort();
        f.debug_struct("Rungs").field("levels", &keys).finish()
    }
}

/// Creates the resource of one level from the resources above it
#[async_trait]
pub trait CreateAction: Send + Sync {
    async fn create(&self, rungs: &Rungs) -> Result<Arc<dyn Resource>, ResourceError>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> CreateAction for FnAction<F>
where
    F: Fn(Rungs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn Resource>, ResourceError>> + Send + 'static,
{
    async fn create(&self, rungs: &Rungs) -> Result<Arc<dyn Resource>, ResourceError> {
        (self.0)(rungs.clone()).await
    }
}

/// Wrap an async closure as a [`CreateAction`]
pub fn action_fn<F, Fut>(create: F) -> Arc<dyn CreateAction>
where
    F: Fn(Rungs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn Resource>, ResourceError>> + Send + 'static,
{
    Arc::new(FnAction(create))
}

/// One level of a ladder and the levels that depend on it
#[derive(Clone)]
pub struct Level {
    key: String,
    action: Arc<dyn CreateAction>,
    dependents: Vec<Level>,
}

impl Level {
    pub fn new(key: impl Into<String>, action: Arc<dyn CreateAction>) -> Self {
        Self {
            key: key.into(),
            action,
            dependents: Vec::new(),
        }
    }

    pub fn from_fn<F, Fut>(key: impl Into<String>, create: F) -> Self
    where
        F: Fn(Rungs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Resource>, ResourceError>> + Send + 'static,
    {
        Self::new(key, action_fn(create))
    }

    /// Add a dependent level
    pub fn then(mut self, level: Level) -> Self {
        self.dependents.push(level);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dependents(&self) -> &[Level] {
        &self.dependents
    }

    pub fn is_terminal(&self) -> bool {
        self.dependents.is_empty()
    }
}

impl fmt::Debug for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Level")
            .field("key", &self.key)
            .field("dependents", &self.dependents)
            .finish_non_exhaustive()
    }
}

/// Retry settings of a ladder
#[derive(Debug, Clone)]
pub struct LadderConfig {
    pub retry_delay: Duration,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl From<&LadderSettings> for LadderConfig {
    fn from(settings: &LadderSettings) -> Self {
        Self {
            retry_delay: settings.retry_delay(),
        }
    }
}

type ReadyCallback = Box<dyn FnOnce(Rungs) + Send>;

/// Cache values shared by every ladder
pub type SharedResource = Arc<dyn Resource>;

struct LadderInner {
    name: String,
    cache: ResourceCache<SharedResource>,
    levels: Vec<Level>,
    config: LadderConfig,
    queue: Mutex<Vec<ReadyCallback>>,
    retries: AtomicU64,
    retry_pending: AtomicBool,
}

/// Slot key of a level: depth, level key and the identity of the parent resource
fn slot_key(depth: usize, key: &str, parent: Option<u64>) -> String {
    match parent {
        Some(identity) => format!("{}:{}@{}", depth, key, identity),
        None => format!("{}:{}@root", depth, key),
    }
}

/// Remove every slot created under `identity`, level by level down the tree
fn evict_dependents(cache: &ResourceCache<SharedResource>, identity: u64) -> usize {
    let mut parents = vec![identity];
    let mut evicted = 0;
    while let Some(parent) = parents.pop() {
        let suffix = format!("@{}", parent);
        let removed = cache.evict(|key| key.ends_with(&suffix));
        evicted += removed.len();
        parents.extend(removed);
    }
    evicted
}

impl LadderInner {
    fn queue(&self) -> MutexGuard<'_, Vec<ReadyCallback>> {
        match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn climb(self: &Arc<Self>) {
        let mut rungs = Rungs::default();
        let mut pending: Vec<(&Level, usize, Option<u64>)> =
            self.levels.iter().rev().map(|level| (level, 0, None)).collect();

        while let Some((level, depth, parent)) = pending.pop() {
            let key = slot_key(depth, &level.key, parent);
            match self.cache.acquire(&key) {
                Acquired::Create(setter) => {
                    self.create(level, setter, rungs);
                    return;
                }
                Acquired::Await(awaiter) => {
                    let ladder = self.clone();
                    awaiter.wait(move |result| match result {
                        Ok(_) => ladder.climb(),
                        Err(_) => ladder.retry_later(),
                    });
                    return;
                }
                Acquired::Ready {
                    value,
                    identity,
                    deleter,
                } => {
                    self.watch(&level.key, &value, deleter);
                    rungs.insert(level.key.clone(), value);
                    for dependent in level.dependents.iter().rev() {
                        pending.push((dependent, depth + 1, Some(identity)));
                    }
                }
            }
        }

        self.flush(rungs);
    }

    fn create(self: &Arc<Self>, level: &Level, setter: Setter<SharedResource>, rungs: Rungs) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::error!(ladder = %self.name, level = %level.key, "No async runtime to create resource on");
                setter.settle(Err(ResourceError::failed("no async runtime")));
                return;
            }
        };

        let ladder = self.clone();
        let key = level.key.clone();
        let action = level.action.clone();
        handle.spawn(async move {
            tracing::debug!(ladder = %ladder.name, level = %key, slot = %setter.key(), "Creating resource");
            let result = action.create(&rungs).await;
            match result {
                Ok(resource) => {
                    setter.settle(Ok(resource));
                    ladder.climb();
                }
                Err(error) => {
                    tracing::warn!(
                        ladder = %ladder.name,
                        level = %key,
                        %error,
                        "Failed to create resource, retrying in {:?}",
                        ladder.config.retry_delay
                    );
                    setter.settle(Err(error));
                    ladder.retry_later();
                }
            }
        });
    }

    /// Clear the level and retry when the resource closes or fails
    fn watch(self: &Arc<Self>, level: &str, resource: &SharedResource, deleter: Deleter<SharedResource>) {
        if !resource.listener_guard().arm() {
            return;
        }

        let ladder: Weak<LadderInner> = Arc::downgrade(self);
        let level = level.to_string();
        resource.subscribe(Box::new(move |event| {
            let cleared = deleter.invalidate();
            let evicted = deleter
                .cache()
                .map_or(0, |cache| evict_dependents(&cache, deleter.identity()));
            let Some(ladder) = ladder.upgrade() else {
                return;
            };
            tracing::warn!(
                ladder = %ladder.name,
                level = %level,
                ?event,
                cleared,
                evicted,
                "Resource lost, reconnecting"
            );
            ladder.retry_later();
        }));
    }

    /// Climb again after the retry delay; concurrent requests share one retry
    fn retry_later(self: &Arc<Self>) {
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        self.retries.fetch_add(1, Ordering::SeqCst);

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.retry_pending.store(false, Ordering::SeqCst);
                tracing::error!(ladder = %self.name, "No async runtime to schedule retry on");
                return;
            }
        };

        let ladder = Arc::downgrade(self);
        let delay = self.config.retry_delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(ladder) = ladder.upgrade() {
                ladder.retry_pending.store(false, Ordering::SeqCst);
                ladder.climb();
            }
        });
    }

    fn flush(&self, rungs: Rungs) {
        let waiting = std::mem::take(&mut *self.queue());
        if waiting.is_empty() {
            return;
        }
        tracing::debug!(ladder = %self.name, callbacks = waiting.len(), "Ladder ready");
        for callback in waiting {
            callback(rungs.clone());
        }
    }
}

/// A tree of dependent levels resolved through a shared [`ResourceCache`]
#[derive(Clone)]
pub struct ConnectionLadder {
    inner: Arc<LadderInner>,
}

impl ConnectionLadder {
    /// Build a ladder; level keys must be unique across the whole tree
    pub fn new(
        name: impl Into<String>,
        cache: ResourceCache<SharedResource>,
        levels: Vec<Level>,
        config: LadderConfig,
    ) -> Result<Self, ResourceError> {
        let name = name.into();
        if levels.is_empty() {
            return Err(ResourceError::InvalidLadder(format!("{} has no levels", name)));
        }

        let mut seen = HashSet::new();
        let mut pending: Vec<&Level> = levels.iter().collect();
        while let Some(level) = pending.pop() {
            if !seen.insert(level.key.as_str()) {
                return Err(ResourceError::InvalidLadder(format!(
                    "{} declares level {} twice",
                    name, level.key
                )));
            }
            pending.extend(level.dependents.iter());
        }

        Ok(Self {
            inner: Arc::new(LadderInner {
                name,
                cache,
                levels,
                config,
                queue: Mutex::new(Vec::new()),
                retries: AtomicU64::new(0),
                retry_pending: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn cache(&self) -> &ResourceCache<SharedResource> {
        &self.inner.cache
    }

    /// Number of retries scheduled so far
    pub fn retries(&self) -> u64 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// Run `callback` once every level is ready
    pub fn ensure_ready<F>(&self, callback: F)
    where
        F: FnOnce(Rungs) + Send + 'static,
    {
        self.inner.queue().push(Box::new(callback));
        self.inner.climb();
    }

    /// Wait until every level is ready
    pub async fn ready(&self) -> Result<Rungs, ResourceError> {
        let (tx, rx) = oneshot::channel();
        self.ensure_ready(move |rungs| {
            let _ = tx.send(rungs);
        });
        rx.await.map_err(|_| ResourceError::Dropped)
    }
}

impl fmt::Debug for ConnectionLadder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLadder")
            .field("name", &self.inner.name)
            .field("levels", &self.inner.levels)
            .field("retries", &self.retries())
            .finish()
    }
}
