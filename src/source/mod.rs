//! Inbound Subscription Manager
//!
//! Owns the single connection to the source MQTT broker. The lifecycle is:
//!
//! 1. [`SubscriptionManager::connect`] drives the client until CONNACK.
//! 2. [`SubscriptionManager::subscribe`] registers every binding, waits for
//!    all SUBACKs, then spawns the dispatch task that keeps the session
//!    alive and feeds deliveries to the [`Dispatcher`].
//! 3. [`SubscriptionManager::set_handler`] installs the downstream callback.
//! 4. [`SubscriptionManager::disconnect`] sends DISCONNECT and waits a
//!    bounded time for the dispatch task to end.
//!
//! Failures in steps 1 and 2 are fatal. Once the dispatch task runs, lost
//! connections are re-established automatically.

mod binding;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::SourceConfig;
use crate::envelope::PresencePayloadStyle;
use crate::error::BridgeError;
use crate::metrics::Metrics;

pub use binding::{default_bindings, Dispatcher, EnvelopeHandler, EnvelopeRule, SubscriptionBinding};

/// State of the source session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// Not connected
    Disconnected,
    /// Initial handshake in progress
    Connecting,
    /// Session established
    Connected,
    /// Session lost, waiting to reconnect
    Reconnecting,
}

/// MQTT subscription manager for the source broker
pub struct SubscriptionManager {
    config: SourceConfig,
    client: AsyncClient,
    /// Present until the dispatch task takes ownership of it
    eventloop: Option<EventLoop>,
    dispatcher: Arc<Dispatcher>,
    status: Arc<RwLock<SourceStatus>>,
    metrics: Arc<Metrics>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionManager {
    /// Create a manager with the default subscription bindings
    pub fn new(
        config: SourceConfig,
        presence_style: PresencePayloadStyle,
        metrics: Arc<Metrics>,
    ) -> Result<Self, BridgeError> {
        Self::with_bindings(config, default_bindings(), presence_style, metrics)
    }

    /// Create a manager with explicit bindings
    pub fn with_bindings(
        config: SourceConfig,
        bindings: Vec<SubscriptionBinding>,
        presence_style: PresencePayloadStyle,
        metrics: Arc<Metrics>,
    ) -> Result<Self, BridgeError> {
        let options = Self::mqtt_options(&config)?;
        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);
        info!(
            "Creating MQTT client (broker={}, client_id={})",
            config.address, config.client_id
        );

        Ok(Self {
            config,
            client,
            eventloop: Some(eventloop),
            dispatcher: Arc::new(Dispatcher::new(bindings, presence_style, metrics.clone())),
            status: Arc::new(RwLock::new(SourceStatus::Disconnected)),
            metrics,
            task: None,
        })
    }

    fn mqtt_options(config: &SourceConfig) -> Result<MqttOptions, BridgeError> {
        let (host, port) = config.parse_address()?;
        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(config.clean_session);
        if let Some((username, password)) = config.credentials() {
            options.set_credentials(username, password);
        }
        Ok(options)
    }

    /// Current session state
    pub fn status(&self) -> SourceStatus {
        *self.status.read()
    }

    /// Dispatcher shared with the dispatch task
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Install the handler invoked for every normalized envelope
    ///
    /// Replaces any previous handler. Messages delivered while no handler is
    /// installed are dropped.
    pub fn set_handler(&self, handler: EnvelopeHandler) {
        self.dispatcher.set_handler(handler);
    }

    /// Establish the session with the source broker
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        let eventloop = self
            .eventloop
            .as_mut()
            .ok_or(BridgeError::InvalidState("MQTT client already running"))?;

        *self.status.write() = SourceStatus::Connecting;
        debug!("Connecting to MQTT broker {}", self.config.address);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return check_connack(&ack),
                    Ok(_) => {}
                    Err(e) => return Err(BridgeError::SourceConnect(e.to_string())),
                }
            }
        };

        let result = match timeout(self.config.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::SourceConnect(format!(
                "no CONNACK within {:?}",
                self.config.connect_timeout
            ))),
        };

        match &result {
            Ok(()) => {
                *self.status.write() = SourceStatus::Connected;
                self.metrics.set_source_connected(true);
                info!("Connected to MQTT broker {}", self.config.address);
            }
            Err(_) => *self.status.write() = SourceStatus::Disconnected,
        }
        result
    }

    /// Register every binding and start dispatching deliveries
    pub async fn subscribe(&mut self) -> Result<(), BridgeError> {
        if self.status() != SourceStatus::Connected {
            return Err(BridgeError::InvalidState("subscribe requires a connected session"));
        }
        let mut eventloop = self
            .eventloop
            .take()
            .ok_or(BridgeError::InvalidState("MQTT client already running"))?;

        info!("Subscribing to {} topic filters", self.dispatcher.bindings().len());
        let result = timeout(
            self.config.connect_timeout,
            register_bindings(&self.client, &mut eventloop, &self.dispatcher),
        )
        .await
        .unwrap_or_else(|_| {
            Err(BridgeError::Subscribe {
                filter: "*".to_string(),
                reason: format!("no SUBACK within {:?}", self.config.connect_timeout),
            })
        });

        if let Err(e) = result {
            self.eventloop = Some(eventloop);
            return Err(e);
        }

        self.task = Some(tokio::spawn(run_dispatch(
            eventloop,
            self.client.clone(),
            self.dispatcher.clone(),
            self.status.clone(),
            self.metrics.clone(),
            self.config.reconnect_delay,
        )));
        info!("Subscribed to MQTT topics");
        Ok(())
    }

    /// Disconnect from the source broker, waiting a bounded time for the
    /// dispatch task to finish
    pub async fn disconnect(&mut self) {
        let Some(task) = self.task.take() else {
            *self.status.write() = SourceStatus::Disconnected;
            self.metrics.set_source_connected(false);
            return;
        };

        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request failed: {}", e);
        }

        let abort = task.abort_handle();
        if timeout(self.config.disconnect_timeout, task).await.is_err() {
            debug!(
                "MQTT dispatch task still running after {:?}, aborting",
                self.config.disconnect_timeout
            );
            abort.abort();
        }

        *self.status.write() = SourceStatus::Disconnected;
        self.metrics.set_source_connected(false);
        info!("Disconnected from MQTT broker {}", self.config.address);
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn check_connack(ack: &ConnAck) -> Result<(), BridgeError> {
    if ack.code == ConnectReturnCode::Success {
        debug!("CONNACK received (session_present={})", ack.session_present);
        Ok(())
    } else {
        Err(BridgeError::SourceConnect(format!(
            "CONNACK rejected: {:?}",
            ack.code
        )))
    }
}

/// Send one SUBSCRIBE per binding and wait for every SUBACK
///
/// Requests pass through the client's bounded channel, which only `poll()`
/// drains, so sending and polling run together. Publishes that arrive
/// meanwhile are dispatched normally.
async fn register_bindings(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    dispatcher: &Dispatcher,
) -> Result<(), BridgeError> {
    let bindings = dispatcher.bindings();

    let send_all = async {
        for binding in bindings {
            client
                .subscribe(binding.filter, binding.qos)
                .await
                .map_err(|e| BridgeError::Subscribe {
                    filter: binding.filter.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok::<(), BridgeError>(())
    };

    // SUBACKs arrive in request order
    let await_acks = async {
        let mut acked = 0;
        while acked < bindings.len() {
            let event = eventloop.poll().await.map_err(|e| BridgeError::Subscribe {
                filter: bindings[acked].filter.to_string(),
                reason: e.to_string(),
            })?;
            match event {
                Event::Incoming(Packet::SubAck(suback)) => {
                    let binding = &bindings[acked];
                    if suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(BridgeError::Subscribe {
                            filter: binding.filter.to_string(),
                            reason: "rejected by broker".to_string(),
                        });
                    }
                    debug!(
                        "Subscribed to {} ({:?}, family={})",
                        binding.filter, binding.qos, binding.family
                    );
                    acked += 1;
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    dispatcher.dispatch(&publish.topic, publish.payload);
                }
                _ => {}
            }
        }
        Ok(())
    };

    tokio::try_join!(send_all, await_acks)?;
    Ok(())
}

/// Re-issue subscriptions after the broker lost our session
///
/// Runs beside the dispatch loop, which keeps draining the request channel.
fn resubscribe(client: &AsyncClient, dispatcher: &Dispatcher) {
    let client = client.clone();
    let bindings = dispatcher.bindings().to_vec();
    tokio::spawn(async move {
        for binding in bindings {
            if let Err(e) = client.subscribe(binding.filter, binding.qos).await {
                error!("Failed to resubscribe to {}: {}", binding.filter, e);
            }
        }
    });
}

/// Poll the client for the lifetime of the session
///
/// Each poll after a connection error makes the client reconnect.
async fn run_dispatch(
    mut eventloop: EventLoop,
    client: AsyncClient,
    dispatcher: Arc<Dispatcher>,
    status: Arc<RwLock<SourceStatus>>,
    metrics: Arc<Metrics>,
    reconnect_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                dispatcher.dispatch(&publish.topic, publish.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if check_connack(&ack).is_err() {
                    warn!("MQTT reconnect rejected: {:?}", ack.code);
                    continue;
                }
                *status.write() = SourceStatus::Connected;
                metrics.set_source_connected(true);
                metrics.source_reconnects.inc();
                info!("Reconnected to MQTT broker");
                if !ack.session_present {
                    resubscribe(&client, &dispatcher);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                if suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    error!("Broker rejected a resubscription (pkid={})", suback.pkid);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT DISCONNECT sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if *status.read() == SourceStatus::Connected {
                    warn!("MQTT connection lost: {}", e);
                } else {
                    debug!("MQTT reconnect failed: {}", e);
                }
                *status.write() = SourceStatus::Reconnecting;
                metrics.set_source_connected(false);
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }

    *status.write() = SourceStatus::Disconnected;
    metrics.set_source_connected(false);
    debug!("MQTT dispatch loop terminated");
}
