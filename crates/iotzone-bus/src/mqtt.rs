//! MQTT bus backed by `rumqttc`.
//!
//! The first [`MessageBus::connect`] blocks until the broker accepts the
//! connection, retrying with a linear backoff. Afterwards a background task
//! polls the event loop, which reconnects on its own after transient
//! failures. Every CONNACK replays the registered subscription patterns so
//! handlers survive reconnects.
//!
//! Inbound messages are handed to one worker task per subscription, which
//! runs the handler to completion.

use crate::bus::{lock, BusError, Handler, LastWill, MessageBus, SubscriptionId};
use crate::config::{parse_mqtt_url, BusConfig};
use async_trait::async_trait;
use iotzone_core::address::{topic_matches, validate_address, validate_pattern};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Span;

/// Backoff increment between initial connection attempts.
pub const BACKOFF_STEP: Duration = Duration::from_secs(1);

/// Upper bound of the initial connection backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Pause after an event loop error before polling again.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Time allowed for the DISCONNECT packet to be flushed.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

const QOS: QoS = QoS::AtLeastOnce;

struct Delivery {
    address: String,
    payload: Vec<u8>,
}

struct MqttSubscription {
    id: SubscriptionId,
    pattern: String,
    sender: mpsc::UnboundedSender<Arc<Delivery>>,
}

type Subscriptions = Arc<Mutex<Vec<MqttSubscription>>>;

/// Bus connected to an MQTT broker.
pub struct MqttBus {
    config: BusConfig,
    client: Mutex<Option<AsyncClient>>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    subscriptions: Subscriptions,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl MqttBus {
    /// Create an unconnected bus.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        let span = tracing::info_span!("mqtt_bus", client_id = %config.client_id);
        Self {
            config,
            client: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            event_loop: Mutex::new(None),
            span,
        }
    }

    /// Emit log events under `span` instead of the default one.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Whether the broker connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn options(&self, last_will: Option<LastWill>) -> Result<MqttOptions, BusError> {
        let (host, port) = parse_mqtt_url(&self.config.broker_url)?;

        let mut options = MqttOptions::new(&self.config.client_id, host, port);
        options.set_keep_alive(self.config.keep_alive);
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username, password);
        }
        if let Some(will) = last_will {
            options.set_last_will(rumqttc::LastWill::new(will.address, will.payload, QOS, true));
        }

        Ok(options)
    }

    /// Poll until the first CONNACK, backing off between failed attempts.
    async fn establish(&self, eventloop: &mut EventLoop) {
        let mut backoff = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match tokio::time::timeout(self.config.connect_timeout, eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    tracing::info!(parent: &self.span, broker = %self.config.broker_url, attempt, "Connected to MQTT broker");
                    return;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    tracing::warn!(parent: &self.span, error = %e, attempt, "MQTT connection attempt failed");
                }
                Err(_) => {
                    tracing::warn!(
                        parent: &self.span,
                        timeout = ?self.config.connect_timeout,
                        attempt,
                        "MQTT connection attempt timed out"
                    );
                }
            }

            backoff = next_backoff(backoff);
            tracing::debug!(parent: &self.span, delay = ?backoff, "Retrying MQTT connection");
            tokio::time::sleep(backoff).await;
        }
    }

    fn active_client(&self) -> Option<AsyncClient> {
        if !self.is_connected() {
            return None;
        }
        lock(&self.client).clone()
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn connect(&self, last_will: Option<LastWill>) -> Result<(), BusError> {
        if lock(&self.client).is_some() {
            return Ok(());
        }

        let options = self.options(last_will)?;
        let (client, mut eventloop) = AsyncClient::new(options, self.config.channel_capacity);

        self.establish(&mut eventloop).await;

        // The client must be visible before `connected` is set, so a
        // concurrent subscribe either sends its own SUBSCRIBE or is replayed.
        *lock(&self.client) = Some(client.clone());
        self.stopping.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        replay_subscriptions(&client, &self.subscriptions, &self.span);

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client,
            self.subscriptions.clone(),
            self.connected.clone(),
            self.stopping.clone(),
            self.span.clone(),
        ));
        *lock(&self.event_loop) = Some(task);
        Ok(())
    }

    async fn disconnect(&self) {
        let client = lock(&self.client).take();
        let task = lock(&self.event_loop).take();
        self.stopping.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);

        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                tracing::debug!(parent: &self.span, error = %e, "MQTT disconnect request failed");
            }
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        tracing::info!(parent: &self.span, "Disconnected from MQTT broker");
    }

    async fn publish(&self, address: &str, retained: bool, payload: &[u8]) -> Result<(), BusError> {
        validate_address(address)?;
        let client = self.active_client().ok_or(BusError::NotConnected)?;

        tracing::debug!(parent: &self.span, address, retained, payload_len = payload.len(), "Publishing message");

        client
            .publish(address, QOS, retained, payload.to_vec())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str, handler: Handler) -> Result<SubscriptionId, BusError> {
        validate_pattern(pattern)?;

        let id = SubscriptionId::next();
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(
            pattern.to_string(),
            handler,
            receiver,
            self.span.clone(),
        ));

        lock(&self.subscriptions).push(MqttSubscription {
            id,
            pattern: pattern.to_string(),
            sender,
        });

        tracing::info!(parent: &self.span, pattern, "Subscribing");

        // Without a connection the pattern is subscribed on the next CONNACK.
        if let Some(client) = self.active_client() {
            if let Err(e) = client.subscribe(pattern, QOS).await {
                // Dropping the entry closes the channel and stops the worker.
                lock(&self.subscriptions).retain(|sub| sub.id != id);
                return Err(BusError::Subscribe(e.to_string()));
            }
        }

        Ok(id)
    }

    async fn unsubscribe(&self, pattern: &str, id: Option<SubscriptionId>) {
        let still_subscribed = {
            let mut subscriptions = lock(&self.subscriptions);
            subscriptions
                .retain(|sub| !(sub.pattern == pattern && id.map_or(true, |id| sub.id == id)));
            subscriptions.iter().any(|sub| sub.pattern == pattern)
        };

        if still_subscribed {
            return;
        }

        tracing::info!(parent: &self.span, pattern, "Unsubscribing");
        if let Some(client) = self.active_client() {
            if let Err(e) = client.unsubscribe(pattern).await {
                tracing::warn!(parent: &self.span, pattern, error = %e, "MQTT unsubscribe failed");
            }
        }
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.event_loop).take() {
            task.abort();
        }
    }
}

/// Next delay of the initial connection retry: +1 s per attempt, capped.
#[must_use]
pub fn next_backoff(current: Duration) -> Duration {
    (current + BACKOFF_STEP).min(MAX_BACKOFF)
}

/// Resubscribe every registered pattern. Runs under the subscription lock.
fn replay_subscriptions(client: &AsyncClient, subscriptions: &Subscriptions, span: &Span) {
    let subscriptions = lock(subscriptions);

    let mut patterns: Vec<&str> = subscriptions.iter().map(|sub| sub.pattern.as_str()).collect();
    patterns.sort_unstable();
    patterns.dedup();

    for pattern in patterns {
        if let Err(e) = client.try_subscribe(pattern, QOS) {
            tracing::warn!(parent: span, pattern, error = %e, "Failed to replay subscription");
        }
    }
}

fn dispatch(subscriptions: &Subscriptions, delivery: Delivery) {
    let delivery = Arc::new(delivery);
    let senders: Vec<_> = lock(subscriptions)
        .iter()
        .filter(|sub| topic_matches(&sub.pattern, &delivery.address))
        .map(|sub| sub.sender.clone())
        .collect();

    for sender in senders {
        // A closed channel means the subscription was removed meanwhile.
        let _ = sender.send(delivery.clone());
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    span: Span,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(
                    parent: &span,
                    topic = %publish.topic,
                    payload_len = publish.payload.len(),
                    "Received MQTT message"
                );
                dispatch(
                    &subscriptions,
                    Delivery {
                        address: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    },
                );
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!(parent: &span, "Reconnected to MQTT broker");
                connected.store(true, Ordering::Release);
                replay_subscriptions(&client, &subscriptions, &span);
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                tracing::debug!(parent: &span, "Subscription acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if stopping.load(Ordering::Acquire) => break,
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::Release);
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                tracing::error!(parent: &span, error = %e, "MQTT error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn run_worker(
    pattern: String,
    handler: Handler,
    mut receiver: mpsc::UnboundedReceiver<Arc<Delivery>>,
    span: Span,
) {
    while let Some(delivery) = receiver.recv().await {
        if let Err(err) = handler(&delivery.address, &delivery.payload) {
            tracing::warn!(
                parent: &span,
                pattern = %pattern,
                address = %delivery.address,
                error = %err,
                "Subscription handler failed"
            );
        }
    }
}
