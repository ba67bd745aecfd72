use crate::error::UnitError;
use crate::event_loop::{Multiplexer, Ready};
use crate::models::{BrokerConfig, Rest2MqttUnitConfig};
use crate::mqtt_service::{MqttConfig, MqttService, PublishOnly};
use crate::rest_server::{RestServer, MAX_CONNECTIONS};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker of one REST to MQTT unit. Returns when `cancel` fires or the unit fails.
pub async fn run(
    unit: Rest2MqttUnitConfig,
    broker: Arc<BrokerConfig>,
    cancel: CancellationToken,
) -> Result<(), UnitError> {
    info!("Unit [{}]: Starting rest2mqtt unit", unit.name);

    let config = MqttConfig::from_broker(&unit.name, None, &broker);
    let mut mqtt = MqttService::new(config, PublishOnly).map_err(|e| {
        crate::fatal!("Unit [{}]: MQTT init failed: {}", unit.name, e);
        e
    })?;

    if !mqtt.connect().await {
        warn!("Unit [{}]: Initial connect failed, will keep retrying", unit.name);
    }

    let (requests_tx, requests_rx) = mpsc::channel(MAX_CONNECTIONS);
    let server = match RestServer::bind(
        &unit.name,
        unit.listen_port,
        unit.mqtt_topic_root.clone(),
        requests_tx,
        &cancel,
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            crate::fatal!("Unit [{}]: {}", unit.name, e);
            mqtt.destroy().await;
            return Err(e.into());
        }
    };

    let mut mux = Multiplexer::new(&unit.name, broker.poll_timeout(), cancel.clone())
        .with_requests(requests_rx);
    let mut published: u64 = 0;

    let result = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        if !mqtt.connected() {
            mqtt.reconnect().await;
        }

        match mux.wait(&mut mqtt).await {
            Ok(Ready::Shutdown) => break Ok(()),
            Ok(Ready::Request(request)) => {
                debug!(
                    "Unit [{}]: Publishing {} bytes on {} at {:?}",
                    unit.name,
                    request.payload.len(),
                    request.topic,
                    request.qos
                );
                let ok = mqtt.publish(&request.topic, request.payload.to_vec(), request.qos).await;
                if ok {
                    published += 1;
                }
                request.complete(ok);
            }
            Ok(Ready::Mqtt(readiness)) => mqtt.drive(readiness).await,
            Ok(Ready::Timeout) => {}
            Err(e) => {
                crate::fatal!("Unit [{}]: {}", unit.name, e);
                break Err(e.into());
            }
        }
    };

    info!("Unit [{}]: Stopping, {} requests published", unit.name, published);
    server.stop().await;
    mqtt.destroy().await;
    result
}
