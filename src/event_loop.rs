use crate::mqtt_service::{MessageHandler, MqttService, Readiness};
use crate::rest_server::PublishRequest;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Error)]
pub enum MultiplexError {
    #[error("Unit [{0}]: HTTP server channel closed")]
    ServerGone(String),
}

/// Outcome of one multiplexed wait.
#[derive(Debug)]
pub enum Ready {
    Shutdown,
    Request(PublishRequest),
    Mqtt(Readiness),
    Timeout,
}

/// Waits on everything a unit reacts to: shutdown, HTTP completions and the MQTT session.
pub struct Multiplexer {
    label: String,
    poll_timeout: Duration,
    cancel: CancellationToken,
    requests: Option<mpsc::Receiver<PublishRequest>>,
}

impl Multiplexer {
    pub fn new(label: &str, poll_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            label: label.to_string(),
            poll_timeout,
            cancel,
            requests: None,
        }
    }

    pub fn with_requests(mut self, requests: mpsc::Receiver<PublishRequest>) -> Self {
        self.requests = Some(requests);
        self
    }

    /// Block until one source is ready or the poll timeout expires.
    ///
    /// Sources are checked in order: shutdown, HTTP completions, MQTT. While the
    /// session is down the timeout shrinks to the remaining reconnect backoff.
    pub async fn wait<H: MessageHandler>(
        &mut self,
        mqtt: &mut MqttService<H>,
    ) -> Result<Ready, MultiplexError> {
        let timeout = match mqtt.next_reconnect_in() {
            Some(backoff) if !mqtt.connected() => backoff.min(self.poll_timeout),
            _ => self.poll_timeout,
        };
        trace!(
            "Unit [{}]: waiting {:?}, mqtt interest: {}",
            self.label,
            timeout,
            mqtt.interest()
        );

        let has_requests = self.requests.is_some();
        tokio::select! {
            biased;

            () = self.cancel.cancelled() => Ok(Ready::Shutdown),
            request = recv(&mut self.requests), if has_requests => match request {
                Some(request) => Ok(Ready::Request(request)),
                None => Err(MultiplexError::ServerGone(self.label.clone())),
            },
            readiness = mqtt.readiness() => Ok(Ready::Mqtt(readiness)),
            () = sleep(timeout) => Ok(Ready::Timeout),
        }
    }
}

async fn recv(requests: &mut Option<mpsc::Receiver<PublishRequest>>) -> Option<PublishRequest> {
    match requests.as_mut() {
        Some(requests) => requests.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BrokerConfig;
    use crate::mqtt_service::{MqttConfig, PublishOnly};
    use bytes::Bytes;
    use rumqttc::QoS;

    fn offline_session() -> MqttService<PublishOnly> {
        let config = MqttConfig::from_broker("mux-test", None, &BrokerConfig::default());
        MqttService::new(config, PublishOnly).expect("init")
    }

    #[tokio::test]
    async fn times_out_when_nothing_is_ready() {
        let mut mqtt = offline_session();
        let mut mux = Multiplexer::new("mux-test", Duration::from_millis(20), CancellationToken::new());
        assert!(matches!(mux.wait(&mut mqtt).await, Ok(Ready::Timeout)));
    }

    #[tokio::test]
    async fn shutdown_wins_over_pending_requests() {
        let mut mqtt = offline_session();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        let mut mux = Multiplexer::new("mux-test", Duration::from_secs(5), cancel.clone()).with_requests(rx);

        let (request, _done) = PublishRequest::new("a/b".into(), Bytes::new(), QoS::AtMostOnce);
        tx.send(request).await.expect("send");
        cancel.cancel();

        assert!(matches!(mux.wait(&mut mqtt).await, Ok(Ready::Shutdown)));
    }

    #[tokio::test]
    async fn delivers_requests_then_reports_a_closed_server() {
        let mut mqtt = offline_session();
        let (tx, rx) = mpsc::channel(4);
        let mut mux =
            Multiplexer::new("mux-test", Duration::from_secs(5), CancellationToken::new()).with_requests(rx);

        let (request, _done) = PublishRequest::new("a/b".into(), Bytes::from_static(b"x"), QoS::AtLeastOnce);
        tx.send(request).await.expect("send");
        drop(tx);

        match mux.wait(&mut mqtt).await {
            Ok(Ready::Request(request)) => {
                assert_eq!(request.topic, "a/b");
                assert_eq!(request.qos, QoS::AtLeastOnce);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(mux.wait(&mut mqtt).await, Err(MultiplexError::ServerGone(_))));
    }
}
