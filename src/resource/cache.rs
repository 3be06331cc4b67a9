//! Single-flight resource cache
//!
//! Each key moves through `empty → pending → ready`. The first caller to
//! acquire an empty key gets a [`Setter`] and creates the value; everyone
//! else either waits for that creation or receives the ready value.

use crate::resource::ResourceError;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;

type Waiter<V> = Box<dyn FnOnce(Result<V, ResourceError>) + Send>;

enum Slot<V> {
    Pending(Vec<Waiter<V>>),
    Ready { value: V, identity: u64 },
}

struct Inner<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
    identities: AtomicU64,
}

impl<V: Clone + Send + 'static> Inner<V> {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn complete(&self, key: &str, result: Result<V, ResourceError>) {
        let waiters = {
            let mut slots = self.slots();
            if !matches!(slots.get(key), Some(Slot::Pending(_))) {
                // evicted while creating; the value belongs to a lost parent
                tracing::debug!(key, "Dropping value of evicted slot");
                return;
            }
            let previous = slots.remove(key);
            if let Ok(value) = &result {
                let identity = self.identities.fetch_add(1, Ordering::Relaxed) + 1;
                slots.insert(
                    key.to_string(),
                    Slot::Ready {
                        value: value.clone(),
                        identity,
                    },
                );
            }
            match previous {
                Some(Slot::Pending(waiters)) => waiters,
                _ => Vec::new(),
            }
        };

        match &result {
            Ok(_) => tracing::debug!(key, waiters = waiters.len(), "Resource ready"),
            Err(error) => tracing::debug!(key, waiters = waiters.len(), %error, "Resource creation failed"),
        }
        notify(waiters, result);
    }
}

/// Run waiters in FIFO order on the next scheduling turn
fn notify<V>(waiters: Vec<Waiter<V>>, result: Result<V, ResourceError>)
where
    V: Clone + Send + 'static,
{
    if waiters.is_empty() {
        return;
    }
    let run = move || {
        for waiter in waiters {
            waiter(result.clone());
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { run() });
        }
        Err(_) => run(),
    }
}

/// Observable state of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Pending { waiters: usize },
    Ready { identity: u64 },
}

/// Result of [`ResourceCache::acquire`]
pub enum Acquired<V: Clone + Send + 'static> {
    /// The key was empty; the caller must create the value
    Create(Setter<V>),
    /// Another caller is creating the value
    Await(Awaiter<V>),
    Ready {
        value: V,
        identity: u64,
        deleter: Deleter<V>,
    },
}

impl<V: Clone + Send + 'static> fmt::Debug for Acquired<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acquired::Create(setter) => f.debug_tuple("Create").field(&setter.key).finish(),
            Acquired::Await(awaiter) => f.debug_tuple("Await").field(&awaiter.key).finish(),
            Acquired::Ready { identity, .. } => {
                f.debug_struct("Ready").field("identity", identity).finish_non_exhaustive()
            }
        }
    }
}

/// Container of resource slots, shareable across ladders
pub struct ResourceCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for ResourceCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> Default for ResourceCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + 'static> ResourceCache<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                identities: AtomicU64::new(0),
            }),
        }
    }

    /// Claim, wait for, or read the value stored under `key`
    pub fn acquire(&self, key: &str) -> Acquired<V> {
        let mut slots = self.inner.slots();
        match slots.get(key) {
            None => {
                slots.insert(key.to_string(), Slot::Pending(Vec::new()));
                Acquired::Create(Setter {
                    key: key.to_string(),
                    inner: self.inner.clone(),
                    settled: false,
                })
            }
            Some(Slot::Pending(_)) => Acquired::Await(Awaiter {
                key: key.to_string(),
                inner: self.inner.clone(),
            }),
            Some(Slot::Ready { value, identity }) => Acquired::Ready {
                value: value.clone(),
                identity: *identity,
                deleter: Deleter {
                    key: key.to_string(),
                    identity: *identity,
                    inner: Arc::downgrade(&self.inner),
                },
            },
        }
    }

    /// Return the value under `key`, creating it with `create` if needed
    ///
    /// Concurrent callers for the same key share one creation.
    pub async fn get_or_try_create<F, Fut>(&self, key: &str, create: F) -> Result<V, ResourceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, ResourceError>>,
    {
        let mut create = Some(create);
        loop {
            match self.acquire(key) {
                Acquired::Ready { value, .. } => return Ok(value),
                Acquired::Await(awaiter) => {
                    // any outcome means acquire again; a failed creation leaves the slot empty
                    let _retry = awaiter.settled().await;
                }
                Acquired::Create(setter) => {
                    let Some(create) = create.take() else {
                        return Err(ResourceError::Abandoned {
                            key: key.to_string(),
                        });
                    };
                    let result = create().await;
                    setter.settle(result.clone());
                    return result;
                }
            }
        }
    }

    pub fn state(&self, key: &str) -> SlotState {
        match self.inner.slots().get(key) {
            None => SlotState::Empty,
            Some(Slot::Pending(waiters)) => SlotState::Pending {
                waiters: waiters.len(),
            },
            Some(Slot::Ready { identity, .. }) => SlotState::Ready {
                identity: *identity,
            },
        }
    }

    /// Remove every slot whose key matches, notifying pending waiters
    ///
    /// Returns the identities of the removed ready values. A creation still
    /// in flight for a removed slot settles without storing its value.
    pub fn evict<F>(&self, matches: F) -> Vec<u64>
    where
        F: Fn(&str) -> bool,
    {
        let mut identities = Vec::new();
        let mut waiting = Vec::new();
        {
            let mut slots = self.inner.slots();
            let keys: Vec<String> = slots.keys().filter(|key| matches(key)).cloned().collect();
            for key in keys {
                match slots.remove(&key) {
                    Some(Slot::Ready { identity, .. }) => identities.push(identity),
                    Some(Slot::Pending(waiters)) => waiting.push((key, waiters)),
                    None => {}
                }
            }
        }

        for (key, waiters) in waiting {
            notify(waiters, Err(ResourceError::Closed(format!("{} was evicted", key))));
        }
        identities
    }

    /// Number of non-empty slots
    pub fn len(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive right to settle a pending slot
///
/// Dropping it unsettled settles the slot with [`ResourceError::Abandoned`].
pub struct Setter<V: Clone + Send + 'static> {
    key: String,
    inner: Arc<Inner<V>>,
    settled: bool,
}

impl<V: Clone + Send + 'static> Setter<V> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store a created value or reset the slot after a failure
    pub fn settle(mut self, result: Result<V, ResourceError>) {
        self.settled = true;
        self.inner.complete(&self.key, result);
    }
}

impl<V: Clone + Send + 'static> Drop for Setter<V> {
    fn drop(&mut self) {
        if !self.settled {
            let key = self.key.clone();
            self.inner
                .complete(&self.key, Err(ResourceError::Abandoned { key }));
        }
    }
}

/// Handle for waiting on another caller's creation
pub struct Awaiter<V> {
    key: String,
    inner: Arc<Inner<V>>,
}

impl<V: Clone + Send + 'static> Awaiter<V> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Register `callback` to run once creation settles
    ///
    /// If the slot settled since [`ResourceCache::acquire`], the callback is
    /// scheduled right away with the current state.
    pub fn wait<F>(self, callback: F)
    where
        F: FnOnce(Result<V, ResourceError>) + Send + 'static,
    {
        let result = {
            let mut slots = self.inner.slots();
            match slots.get_mut(&self.key) {
                Some(Slot::Pending(waiters)) => {
                    waiters.push(Box::new(callback));
                    return;
                }
                Some(Slot::Ready { value, .. }) => Ok(value.clone()),
                None => Err(ResourceError::Failed(format!(
                    "creation of {} settled without a value",
                    self.key
                ))),
            }
        };
        notify(vec![Box::new(callback) as Waiter<V>], result);
    }

    /// Wait for the creation outcome
    pub async fn settled(self) -> Result<V, ResourceError> {
        let (tx, rx) = oneshot::channel();
        self.wait(move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(ResourceError::Dropped))
    }
}

/// Resets a ready slot, but only while it still holds the value it was issued for
pub struct Deleter<V> {
    key: String,
    identity: u64,
    inner: Weak<Inner<V>>,
}

impl<V> Clone for Deleter<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            identity: self.identity,
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> Deleter<V> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    /// The cache the slot lives in, while it is still alive
    pub fn cache(&self) -> Option<ResourceCache<V>> {
        self.inner.upgrade().map(|inner| ResourceCache { inner })
    }

    /// Returns whether the slot was cleared
    pub fn invalidate(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut slots = inner.slots();
        let current = matches!(
            slots.get(&self.key),
            Some(Slot::Ready { identity, .. }) if *identity == self.identity
        );
        if current {
            slots.remove(&self.key);
            tracing::debug!(key = %self.key, identity = self.identity, "Resource invalidated");
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn expect_setter(acquired: Acquired<u32>) -> Setter<u32> {
        match acquired {
            Acquired::Create(setter) => setter,
            other => panic!("expected Create, got {:?}", other),
        }
    }

    #[test]
    fn test_first_acquire_creates_then_ready() {
        let cache = ResourceCache::<u32>::new();
        let setter = expect_setter(cache.acquire("db"));
        assert_eq!(cache.state("db"), SlotState::Pending { waiters: 0 });

        assert!(matches!(cache.acquire("db"), Acquired::Await(_)));

        setter.settle(Ok(7));
        match cache.acquire("db") {
            Acquired::Ready { value, identity, .. } => {
                assert_eq!(value, 7);
                assert_eq!(cache.state("db"), SlotState::Ready { identity });
            }
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_resets_slot() {
        let cache = ResourceCache::<u32>::new();
        expect_setter(cache.acquire("db")).settle(Err(ResourceError::failed("refused")));

        assert_eq!(cache.state("db"), SlotState::Empty);
        assert!(matches!(cache.acquire("db"), Acquired::Create(_)));
    }

    #[test]
    fn test_dropped_setter_abandons() {
        let cache = ResourceCache::<u32>::new();
        let setter = expect_setter(cache.acquire("db"));

        let seen = Arc::new(StdMutex::new(None));
        let sink = seen.clone();
        match cache.acquire("db") {
            Acquired::Await(awaiter) => awaiter.wait(move |result| {
                *sink.lock().unwrap() = Some(result);
            }),
            other => panic!("expected Await, got {:?}", other),
        }

        drop(setter);
        assert_eq!(cache.state("db"), SlotState::Empty);
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(Err(ResourceError::Abandoned { key: "db".to_string() }))
        );
    }

    #[test]
    fn test_stale_deleter_is_noop() {
        let cache = ResourceCache::<u32>::new();
        expect_setter(cache.acquire("db")).settle(Ok(1));
        let Acquired::Ready { deleter: stale, .. } = cache.acquire("db") else {
            panic!("expected Ready");
        };

        assert!(stale.invalidate());
        expect_setter(cache.acquire("db")).settle(Ok(2));

        assert!(!stale.invalidate());
        assert!(matches!(cache.acquire("db"), Acquired::Ready { value: 2, .. }));
    }

    #[test]
    fn test_wait_after_settle_fires() {
        let cache = ResourceCache::<u32>::new();
        let setter = expect_setter(cache.acquire("db"));
        let Acquired::Await(awaiter) = cache.acquire("db") else {
            panic!("expected Await");
        };
        setter.settle(Ok(5));

        let seen = Arc::new(StdMutex::new(None));
        let sink = seen.clone();
        awaiter.wait(move |result| *sink.lock().unwrap() = Some(result));
        assert_eq!(seen.lock().unwrap().clone(), Some(Ok(5)));
    }

    #[tokio::test]
    async fn test_get_or_try_create_shares_creation() {
        let cache = ResourceCache::<u32>::new();
        let creations = Arc::new(AtomicU64::new(0));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let cache = cache.clone();
                let creations = creations.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_try_create("pool", || async move {
                            creations.fetch_add(1, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            Ok(11)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(11));
        }
        assert_eq!(creations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_creates_after_failed_creation() {
        let cache = ResourceCache::<u32>::new();
        let first = expect_setter(cache.acquire("pool"));

        let waiting = cache.clone();
        let task = tokio::spawn(async move {
            waiting.get_or_try_create("pool", || async { Ok(9) }).await
        });
        tokio::task::yield_now().await;
        assert_eq!(cache.state("pool"), SlotState::Pending { waiters: 1 });

        first.settle(Err(ResourceError::failed("refused")));

        assert_eq!(task.await.unwrap(), Ok(9));
        assert!(matches!(cache.state("pool"), SlotState::Ready { .. }));
    }

    #[test]
    fn test_evict_removes_matching_slots() {
        let cache = ResourceCache::<u32>::new();
        expect_setter(cache.acquire("1:channel@4")).settle(Ok(1));
        expect_setter(cache.acquire("1:channel@14")).settle(Ok(2));
        let in_flight = expect_setter(cache.acquire("2:queue@4"));

        let seen = Arc::new(StdMutex::new(None));
        let sink = seen.clone();
        let Acquired::Await(awaiter) = cache.acquire("2:queue@4") else {
            panic!("expected Await");
        };
        awaiter.wait(move |result| *sink.lock().unwrap() = Some(result));

        let evicted = cache.evict(|key| key.ends_with("@4"));

        assert_eq!(evicted.len(), 1);
        assert_eq!(cache.len(), 1);
        assert!(matches!(seen.lock().unwrap().clone(), Some(Err(ResourceError::Closed(_)))));

        // the creation that was running for the evicted slot is not stored
        in_flight.settle(Ok(3));
        assert_eq!(cache.state("2:queue@4"), SlotState::Empty);
        assert_eq!(cache.len(), 1);
    }
}
