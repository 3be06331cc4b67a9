//! Message broker collaborator
//!
//! Broker connections, channels and their declarations are ladder levels,
//! so concurrent publishers share one connection and one channel per track
//! and lost connections are re-established after the ladder's retry delay.

pub mod memory;
pub mod topology;

pub use memory::{BrokerStats, MemoryBroker};
pub use topology::{Topology, Track, TrackKind};

use crate::core::scope::Fragment;
use crate::execution::{Input, Next};
use crate::resource::{
    ConnectionLadder, LadderConfig, LifecycleListener, ListenerGuard, Resource, ResourceCache,
    ResourceError, Rungs, SharedResource,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn envelope(&self) -> Result<Envelope, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// An outbound message
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub payload: Vec<u8>,
    pub reply_to: Option<String>,
}

impl Message {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            payload: serde_json::to_vec(value)?,
            reply_to: None,
        })
    }

    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// JSON body of every message sent through the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notif_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Scope fragment with the envelope's fields
    pub fn to_fragment(&self) -> Result<Fragment, serde_json::Error> {
        let mut fragment = Fragment::new();
        if let serde_json::Value::Object(values) = serde_json::to_value(self)? {
            fragment = Fragment::from(values);
        }
        Ok(fragment)
    }
}

pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Opens broker connections
#[async_trait]
pub trait BrokerDriver: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, ResourceError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, ResourceError>;

    fn subscribe(&self, listener: LifecycleListener);

    fn listener_guard(&self) -> &ListenerGuard;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn assert_exchange(&self, name: &str, kind: &str) -> Result<(), ResourceError>;

    async fn assert_queue(&self, name: &str) -> Result<(), ResourceError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ResourceError>;

    /// Start delivering messages of `queue` to `handler`; returns the consumer tag
    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String, ResourceError>;

    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<(), ResourceError>;

    fn ack(&self, tag: u64);

    fn nack(&self, tag: u64);

    fn subscribe(&self, listener: LifecycleListener);

    fn listener_guard(&self) -> &ListenerGuard;
}

/// Ladder resource wrapping a broker connection
pub struct ConnectionHandle(pub Arc<dyn BrokerConnection>);

impl Resource for ConnectionHandle {
    fn subscribe(&self, listener: LifecycleListener) {
        self.0.subscribe(listener)
    }

    fn listener_guard(&self) -> &ListenerGuard {
        self.0.listener_guard()
    }
}

/// Ladder resource wrapping a broker channel
pub struct ChannelHandle(pub Arc<dyn BrokerChannel>);

impl Resource for ChannelHandle {
    fn subscribe(&self, listener: LifecycleListener) {
        self.0.subscribe(listener)
    }

    fn listener_guard(&self) -> &ListenerGuard {
        self.0.listener_guard()
    }
}

/// Connection URLs handed out in rotation
#[derive(Debug, Default)]
pub struct UrlPool {
    urls: Mutex<VecDeque<String>>,
}

impl UrlPool {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: Mutex::new(urls.into_iter().map(Into::into).collect()),
        }
    }

    /// Rotate the pool and return its new head
    pub fn next(&self) -> Option<String> {
        let mut urls = self.urls.lock().ok()?;
        if let Some(url) = urls.pop_front() {
            urls.push_back(url);
        }
        urls.front().cloned()
    }

    pub fn len(&self) -> usize {
        self.urls.lock().map(|u| u.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Publishes, acks and nacks over a broker topology ladder
#[derive(Clone)]
pub struct BrokerClient {
    ladder: ConnectionLadder,
    topology: Arc<Topology>,
}

impl BrokerClient {
    pub fn new(
        driver: Arc<dyn BrokerDriver>,
        pool: Arc<UrlPool>,
        topology: Topology,
        cache: ResourceCache<SharedResource>,
        config: LadderConfig,
    ) -> Result<Self, ResourceError> {
        let levels = vec![topology.levels(driver, pool)];
        let ladder = ConnectionLadder::new(
            format!("mq:{}", topology.model()),
            cache,
            levels,
            config,
        )?;
        Ok(Self {
            ladder,
            topology: Arc::new(topology),
        })
    }

    pub fn ladder(&self) -> &ConnectionLadder {
        &self.ladder
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Queue replies to this instance arrive on
    pub fn reply_queue(&self) -> String {
        self.topology.reply_queue()
    }

    pub async fn ready(&self) -> Result<Rungs, ResourceError> {
        self.ladder.ready().await
    }

    /// Continue a pipeline once every track is ready
    pub fn continue_when_ready(&self, next: Next) {
        self.ladder.ensure_ready(move |_| next.call(Input::new()));
    }

    async fn channel(&self, kind: TrackKind) -> Result<(Arc<dyn BrokerChannel>, String), ResourceError> {
        let track = self
            .topology
            .track(kind)
            .ok_or_else(|| ResourceError::failed(format!("no {:?} track configured", kind)))?;
        let rungs = self.ready().await?;
        let handle = rungs.require::<ChannelHandle>(&track.channel_key())?;
        Ok((handle.0.clone(), track.exchange.clone()))
    }

    pub async fn publish(
        &self,
        kind: TrackKind,
        routing_key: &str,
        message: Message,
    ) -> Result<(), ResourceError> {
        let (channel, exchange) = self.channel(kind).await?;
        channel.publish(&exchange, routing_key, message).await
    }

    pub async fn ack(&self, kind: TrackKind, tag: u64) -> Result<(), ResourceError> {
        let (channel, _) = self.channel(kind).await?;
        channel.ack(tag);
        Ok(())
    }

    pub async fn nack(&self, kind: TrackKind, tag: u64) -> Result<(), ResourceError> {
        let (channel, _) = self.channel(kind).await?;
        channel.nack(tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_pool_rotates() {
        let pool = UrlPool::new(["amqp://a", "amqp://b", "amqp://c"]);
        assert_eq!(pool.next().as_deref(), Some("amqp://b"));
        assert_eq!(pool.next().as_deref(), Some("amqp://c"));
        assert_eq!(pool.next().as_deref(), Some("amqp://a"));

        assert_eq!(UrlPool::default().next(), None);
    }

    #[test]
    fn test_envelope_fragment() {
        let envelope = Envelope {
            event_id: "e-1".to_string(),
            event_name: Some("greet".to_string()),
            notif_name: None,
            reply_to: None,
            data: serde_json::json!({"name": "ann"}),
        };
        let message = Message::json(&envelope).unwrap();
        let text = String::from_utf8(message.payload).unwrap();
        assert!(text.contains("\"eventId\":\"e-1\""));
        assert!(!text.contains("notifName"));

        let fragment = envelope.to_fragment().unwrap();
        assert_eq!(fragment.get("eventName"), Some(&serde_json::json!("greet")));
    }
}
