use crate::error::UnitError;
use crate::event_loop::{Multiplexer, Ready};
use crate::models::{BrokerConfig, Mqtt2RestUnitConfig};
use crate::mqtt_service::{InboundMessage, MessageHandler, MqttConfig, MqttService};
use crate::rest_client::RestClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Remainder of `topic` below `root`, without the separating `/`.
pub fn topic_suffix<'a>(root: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(root)?;
    if rest.is_empty() {
        return Some(rest);
    }
    rest.strip_prefix('/')
}

/// Forwards every message below the topic root as a POST to the web service.
pub struct RestForwarder {
    label: String,
    topic_root: String,
    client: RestClient,
    forwarded: u64,
}

impl RestForwarder {
    pub fn new(label: &str, topic_root: &str, client: RestClient) -> Self {
        Self {
            label: label.to_string(),
            topic_root: topic_root.to_string(),
            client,
            forwarded: 0,
        }
    }

    /// Messages handed to the web service so far, whatever their response.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

impl MessageHandler for RestForwarder {
    async fn on_message(&mut self, message: InboundMessage) {
        debug!(
            "Unit [{}]: Message on topic {} ({} bytes, {:?})",
            self.label,
            message.topic,
            message.payload.len(),
            message.qos
        );

        let Some(suffix) = topic_suffix(&self.topic_root, &message.topic) else {
            warn!(
                "Unit [{}]: Topic {} is not below {}, message dropped",
                self.label, message.topic, self.topic_root
            );
            return;
        };

        match self.client.post(suffix, message.payload).await {
            Ok(status) if status.is_success() => {
                self.forwarded += 1;
                info!("Unit [{}]: POST {} answered {}", self.label, suffix, status);
            }
            Ok(status) => {
                self.forwarded += 1;
                warn!("Unit [{}]: POST {} answered {}", self.label, suffix, status);
            }
            Err(e) => error!("Unit [{}]: {}", self.label, e),
        }
    }
}

/// Worker of one MQTT to REST unit. Returns when `cancel` fires or the unit fails.
pub async fn run(
    unit: Mqtt2RestUnitConfig,
    broker: Arc<BrokerConfig>,
    cancel: CancellationToken,
) -> Result<(), UnitError> {
    info!("Unit [{}]: Starting mqtt2rest unit", unit.name);

    let timeout = unit.webservice_timeout_ms.map(Duration::from_millis);
    let client = RestClient::new(&unit.webservice_baseurl, timeout).map_err(|e| {
        crate::fatal!("Unit [{}]: {}", unit.name, e);
        e
    })?;
    let forwarder = RestForwarder::new(&unit.name, &unit.mqtt_topic, client);

    let config = MqttConfig::from_broker(&unit.name, Some(unit.mqtt_topic.clone()), &broker);
    let mut mqtt = MqttService::new(config, forwarder).map_err(|e| {
        crate::fatal!("Unit [{}]: MQTT init failed: {}", unit.name, e);
        e
    })?;

    if !mqtt.connect().await {
        warn!("Unit [{}]: Initial connect failed, will keep retrying", unit.name);
    }

    let mut mux = Multiplexer::new(&unit.name, broker.poll_timeout(), cancel.clone());
    let result = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        if !mqtt.connected() {
            mqtt.reconnect().await;
        }

        match mux.wait(&mut mqtt).await {
            Ok(Ready::Shutdown) => break Ok(()),
            Ok(Ready::Mqtt(readiness)) => mqtt.drive(readiness).await,
            Ok(Ready::Timeout) => {}
            Ok(Ready::Request(request)) => request.complete(false),
            Err(e) => {
                crate::fatal!("Unit [{}]: {}", unit.name, e);
                break Err(e.into());
            }
        }
    };

    info!(
        "Unit [{}]: Stopping, {} messages forwarded",
        unit.name,
        mqtt.handler().forwarded()
    );
    mqtt.destroy().await;
    result
}
