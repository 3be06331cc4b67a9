//! Broker topology - the tracks a model's manager listens and publishes on

use crate::broker::{
    BrokerDriver, ChannelHandle, ConnectionHandle, DeliveryHandler, UrlPool,
};
use crate::resource::{Declared, Level, ResourceError, Rungs, SharedResource};
use std::fmt;
use std::sync::Arc;

/// Which of a model's tracks a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Replies to events this instance sent
    Result,
    Notification,
    Event,
}

/// One exchange → queue → binding → consumer chain
#[derive(Clone)]
pub struct Track {
    pub kind: TrackKind,
    pub exchange: String,
    pub queue: String,
    /// Tracks without a routing key stop after the queue is declared
    pub routing_key: Option<String>,
    pub handler: Option<DeliveryHandler>,
}

impl Track {
    pub fn channel_key(&self) -> String {
        format!("ch={}", self.exchange)
    }

    fn level(&self) -> Level {
        let exchange = self.exchange.clone();
        let channel_key = self.channel_key();

        let queue_level = {
            let queue = self.queue.clone();
            let channel_key = channel_key.clone();
            Level::from_fn(format!("q={}", self.queue), move |rungs: Rungs| {
                let queue = queue.clone();
                let channel_key = channel_key.clone();
                async move {
                    let channel = rungs.require::<ChannelHandle>(&channel_key)?;
                    channel.0.assert_queue(&queue).await?;
                    Ok(Declared::new(queue) as SharedResource)
                }
            })
        };

        let queue_level = match &self.routing_key {
            None => queue_level,
            Some(routing_key) => {
                let bind = {
                    let queue = self.queue.clone();
                    let exchange = exchange.clone();
                    let routing_key = routing_key.clone();
                    let channel_key = channel_key.clone();
                    Level::from_fn(format!("routingKey={}:{}", exchange, routing_key), move |rungs: Rungs| {
                        let queue = queue.clone();
                        let exchange = exchange.clone();
                        let routing_key = routing_key.clone();
                        let channel_key = channel_key.clone();
                        async move {
                            let channel = rungs.require::<ChannelHandle>(&channel_key)?;
                            channel.0.bind_queue(&queue, &exchange, &routing_key).await?;
                            Ok(Declared::new(routing_key) as SharedResource)
                        }
                    })
                };

                let bind = match &self.handler {
                    None => bind,
                    Some(handler) => {
                        let queue = self.queue.clone();
                        let handler = handler.clone();
                        let channel_key = channel_key.clone();
                        bind.then(Level::from_fn(
                            format!("listener={}", exchange),
                            move |rungs: Rungs| {
                                let queue = queue.clone();
                                let handler = handler.clone();
                                let channel_key = channel_key.clone();
                                async move {
                                    let channel = rungs.require::<ChannelHandle>(&channel_key)?;
                                    let tag = channel.0.consume(&queue, handler).await?;
                                    Ok(Declared::new(tag) as SharedResource)
                                }
                            },
                        ))
                    }
                };
                queue_level.then(bind)
            }
        };

        let exchange_level = {
            let exchange = exchange.clone();
            let channel_key = channel_key.clone();
            Level::from_fn(format!("ex={}", self.exchange), move |rungs: Rungs| {
                let exchange = exchange.clone();
                let channel_key = channel_key.clone();
                async move {
                    let channel = rungs.require::<ChannelHandle>(&channel_key)?;
                    channel.0.assert_exchange(&exchange, "topic").await?;
                    Ok(Declared::new(exchange) as SharedResource)
                }
            })
        };

        Level::from_fn(channel_key, |rungs: Rungs| async move {
            let connection = rungs.require::<ConnectionHandle>(CONNECTION_KEY)?;
            let channel = connection.0.create_channel().await?;
            Ok(Arc::new(ChannelHandle(channel)) as SharedResource)
        })
        .then(exchange_level.then(queue_level))
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("kind", &self.kind)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("consumes", &self.handler.is_some())
            .finish()
    }
}

const CONNECTION_KEY: &str = "conn=mq";

/// Tracks of one model's manager on one application instance
#[derive(Debug, Clone)]
pub struct Topology {
    model: String,
    instance: String,
    tracks: Vec<Track>,
}

/// `Human` → `human`
fn camel_case(model: &str) -> String {
    let mut chars = model.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Instance name of this process: `<host>:0`
pub fn default_instance() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}:0", host)
}

impl Topology {
    /// Topology with no tracks yet
    pub fn new(model: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            model: camel_case(&model.into()),
            instance: instance.into(),
            tracks: Vec::new(),
        }
    }

    /// Topology with the result, notification and event tracks
    pub fn standard(
        model: impl Into<String>,
        instance: impl Into<String>,
        event_name: Option<&str>,
        notif_name: Option<&str>,
    ) -> Self {
        Self::new(model, instance)
            .with_results(None)
            .with_notifications(notif_name, None)
            .with_events(event_name, None)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn reply_queue(&self) -> String {
        format!("{}ManagerEventResults.{}", self.model, self.instance)
    }

    pub fn with_results(mut self, handler: Option<DeliveryHandler>) -> Self {
        let queue = self.reply_queue();
        self.tracks.push(Track {
            kind: TrackKind::Result,
            exchange: "event_results".to_string(),
            routing_key: Some(queue.clone()),
            queue,
            handler,
        });
        self
    }

    pub fn with_notifications(mut self, notif_name: Option<&str>, handler: Option<DeliveryHandler>) -> Self {
        self.tracks.push(Track {
            kind: TrackKind::Notification,
            exchange: "event_notifications".to_string(),
            queue: format!("{}ManagerEventNotifications", self.model),
            routing_key: notif_name.map(String::from),
            handler,
        });
        self
    }

    pub fn with_events(mut self, event_name: Option<&str>, handler: Option<DeliveryHandler>) -> Self {
        self.tracks.push(Track {
            kind: TrackKind::Event,
            exchange: "events".to_string(),
            queue: format!("{}ManagerEvents", self.model),
            routing_key: event_name.map(String::from),
            handler,
        });
        self
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Ladder root: the connection, then one channel subtree per track
    pub fn levels(&self, driver: Arc<dyn BrokerDriver>, pool: Arc<UrlPool>) -> Level {
        let connection = Level::from_fn(CONNECTION_KEY, move |_| {
            let driver = driver.clone();
            let pool = pool.clone();
            async move {
                let url = pool
                    .next()
                    .ok_or_else(|| ResourceError::failed("broker pool has no urls"))?;
                tracing::debug!(%url, "Connecting to broker");
                let connection = driver.connect(&url).await?;
                Ok(Arc::new(ConnectionHandle(connection)) as SharedResource)
            }
        });

        self.tracks
            .iter()
            .fold(connection, |connection, track| connection.then(track.level()))
    }
}
