//! In-process broker driver
//!
//! Routes published messages to bound queues by exact routing key (or `#`)
//! and counts every declaration, so callers can check what a ladder did.
//! Connection failures and connection loss can be injected.

use crate::broker::{BrokerChannel, BrokerConnection, BrokerDriver, Delivery, DeliveryHandler, Message};
use crate::resource::{Lifecycle, LifecycleListener, ListenerGuard, Listeners, ResourceError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Snapshot of broker call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connects: usize,
    pub refused: usize,
    pub channels: usize,
    pub exchanges: usize,
    pub queues: usize,
    pub bindings: usize,
    pub consumers: usize,
    pub published: usize,
    pub delivered: usize,
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    refused: AtomicUsize,
    channels: AtomicUsize,
    exchanges: AtomicUsize,
    queues: AtomicUsize,
    bindings: AtomicUsize,
    consumers: AtomicUsize,
    published: AtomicUsize,
    delivered: AtomicUsize,
}

#[derive(Default)]
struct BrokerState {
    fail_connects: AtomicUsize,
    counters: Counters,
    /// exchange → (routing key, queue)
    bindings: Mutex<HashMap<String, Vec<(String, String)>>>,
    /// queue → consumers
    consumers: Mutex<HashMap<String, Vec<DeliveryHandler>>>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    tags: AtomicU64,
    acked: Mutex<Vec<u64>>,
    nacked: Mutex<Vec<u64>>,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// In-memory [`BrokerDriver`]
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.state.fail_connects.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.state.counters;
        BrokerStats {
            connects: c.connects.load(Ordering::SeqCst),
            refused: c.refused.load(Ordering::SeqCst),
            channels: c.channels.load(Ordering::SeqCst),
            exchanges: c.exchanges.load(Ordering::SeqCst),
            queues: c.queues.load(Ordering::SeqCst),
            bindings: c.bindings.load(Ordering::SeqCst),
            consumers: c.consumers.load(Ordering::SeqCst),
            published: c.published.load(Ordering::SeqCst),
            delivered: c.delivered.load(Ordering::SeqCst),
        }
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.acked.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn nacked(&self) -> Vec<u64> {
        self.state.nacked.lock().map(|n| n.clone()).unwrap_or_default()
    }

    /// Close every open connection and its channels, as a server restart would
    pub fn close_connections(&self, reason: &str) -> usize {
        let connections: Vec<_> = match self.state.connections.lock() {
            Ok(mut connections) => connections.drain(..).filter_map(|c| c.upgrade()).collect(),
            Err(_) => Vec::new(),
        };
        if let Ok(mut consumers) = self.state.consumers.lock() {
            consumers.clear();
        }
        for connection in &connections {
            connection.close(reason);
        }
        connections.len()
    }
}

#[async_trait]
impl BrokerDriver for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, ResourceError> {
        let refuse = self
            .state
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            bump(&self.state.counters.refused);
            return Err(ResourceError::failed(format!("connection refused by {}", url)));
        }

        bump(&self.state.counters.connects);
        let connection = Arc::new(MemoryConnection {
            state: self.state.clone(),
            listeners: Listeners::default(),
            guard: ListenerGuard::default(),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        if let Ok(mut connections) = self.state.connections.lock() {
            connections.push(Arc::downgrade(&connection));
        }
        Ok(connection)
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    listeners: Listeners,
    guard: ListenerGuard,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels = self
            .channels
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default();
        for channel in channels {
            channel.close(reason);
        }
        self.listeners.emit(Lifecycle::Closed(Some(reason.to_string())));
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, ResourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ResourceError::Closed("connection is closed".to_string()));
        }
        bump(&self.state.counters.channels);
        let channel = Arc::new(MemoryChannel {
            state: self.state.clone(),
            listeners: Listeners::default(),
            guard: ListenerGuard::default(),
            closed: AtomicBool::new(false),
        });
        if let Ok(mut channels) = self.channels.lock() {
            channels.push(channel.clone());
        }
        Ok(channel)
    }

    fn subscribe(&self, listener: LifecycleListener) {
        self.listeners.subscribe(listener)
    }

    fn listener_guard(&self) -> &ListenerGuard {
        &self.guard
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    listeners: Listeners,
    guard: ListenerGuard,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn close(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.listeners.emit(Lifecycle::Closed(Some(reason.to_string())));
        }
    }

    fn ensure_open(&self) -> Result<(), ResourceError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ResourceError::Closed("channel is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(&self, name: &str, _kind: &str) -> Result<(), ResourceError> {
        self.ensure_open()?;
        bump(&self.state.counters.exchanges);
        if let Ok(mut bindings) = self.state.bindings.lock() {
            bindings.entry(name.to_string()).or_default();
        }
        Ok(())
    }

    async fn assert_queue(&self, name: &str) -> Result<(), ResourceError> {
        self.ensure_open()?;
        bump(&self.state.counters.queues);
        if let Ok(mut consumers) = self.state.consumers.lock() {
            consumers.entry(name.to_string()).or_default();
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ResourceError> {
        self.ensure_open()?;
        bump(&self.state.counters.bindings);
        let mut bindings = self
            .state
            .bindings
            .lock()
            .map_err(|_| ResourceError::failed("binding table poisoned"))?;
        let routes = bindings
            .get_mut(exchange)
            .ok_or_else(|| ResourceError::failed(format!("exchange {} not declared", exchange)))?;
        let route = (routing_key.to_string(), queue.to_string());
        if !routes.contains(&route) {
            routes.push(route);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String, ResourceError> {
        self.ensure_open()?;
        bump(&self.state.counters.consumers);
        let mut consumers = self
            .state
            .consumers
            .lock()
            .map_err(|_| ResourceError::failed("consumer table poisoned"))?;
        let list = consumers.entry(queue.to_string()).or_default();
        list.push(handler);
        Ok(format!("{}#{}", queue, list.len()))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<(), ResourceError> {
        self.ensure_open()?;
        bump(&self.state.counters.published);

        let queues: Vec<String> = {
            let bindings = self
                .state
                .bindings
                .lock()
                .map_err(|_| ResourceError::failed("binding table poisoned"))?;
            let routes = bindings
                .get(exchange)
                .ok_or_else(|| ResourceError::failed(format!("exchange {} not declared", exchange)))?;
            routes
                .iter()
                .filter(|(key, _)| key == routing_key || key == "#")
                .map(|(_, queue)| queue.clone())
                .collect()
        };

        let targets: Vec<DeliveryHandler> = {
            let consumers = self
                .state
                .consumers
                .lock()
                .map_err(|_| ResourceError::failed("consumer table poisoned"))?;
            queues
                .iter()
                .filter_map(|queue| consumers.get(queue).and_then(|list| list.first().cloned()))
                .collect()
        };

        for handler in targets {
            let delivery = Delivery {
                tag: self.state.tags.fetch_add(1, Ordering::SeqCst) + 1,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reply_to: message.reply_to.clone(),
                payload: message.payload.clone(),
            };
            bump(&self.state.counters.delivered);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { handler(delivery) });
                }
                Err(_) => handler(delivery),
            }
        }
        Ok(())
    }

    fn ack(&self, tag: u64) {
        if let Ok(mut acked) = self.state.acked.lock() {
            acked.push(tag);
        }
    }

    fn nack(&self, tag: u64) {
        if let Ok(mut nacked) = self.state.nacked.lock() {
            nacked.push(tag);
        }
    }

    fn subscribe(&self, listener: LifecycleListener) {
        self.listeners.subscribe(listener)
    }

    fn listener_guard(&self) -> &ListenerGuard {
        &self.guard
    }
}
