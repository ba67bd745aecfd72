use crate::models::BrokerConfig;
use bytes::Bytes;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use uuid::Uuid;

/// Longest accepted subscription filter, `"<topic>/#"` included.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Packet size limit applied in both directions.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);
/// How long a connected session may take to make room for one more publish.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Unit name, used for log correlation and as client id prefix.
    pub label: String,
    /// Subscribe to `"<topic>/#"` on every connect when set.
    pub topic: Option<String>,
    pub broker_host: String,
    pub broker_port: u16,
    pub keepalive: u64,

    pub tls_enabled: bool,
    pub cafile: Option<PathBuf>,
    pub capath: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,

    pub user_pw_auth_enabled: bool,
    pub user: Option<String>,
    pub pw: Option<String>,

    pub connect_attempts: u32,
    pub retry_interval: Duration,
}

impl MqttConfig {
    pub fn from_broker(label: &str, topic: Option<String>, broker: &BrokerConfig) -> Self {
        Self {
            label: label.to_string(),
            topic,
            broker_host: broker.host.clone(),
            broker_port: broker.port,
            keepalive: broker.keepalive,
            tls_enabled: broker.tls,
            cafile: broker.cafile.clone(),
            capath: broker.capath.clone(),
            certfile: broker.certfile.clone(),
            keyfile: broker.keyfile.clone(),
            user_pw_auth_enabled: broker.user_pw,
            user: broker.user.clone(),
            pw: broker.pw.clone(),
            connect_attempts: broker.connect_attempts.max(1),
            retry_interval: broker.retry_interval(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid client label '{0}'")]
    InvalidLabel(String),
    #[error("Topic filter '{0}' is too long, the max is {max}", max = MAX_TOPIC_LENGTH)]
    TopicTooLong(String),
    #[error("Cannot read TLS material {}: {}", .0.display(), .1)]
    TlsMaterial(PathBuf, #[source] std::io::Error),
    #[error("No CA certificate found in {}", .0.display())]
    NoCaCertificate(PathBuf),
    #[error("TLS client certificate and key must be configured together")]
    TlsClientAuth,
    #[error("Unable to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Read/write interest of the session for the next wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl std::fmt::Display for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.readable, self.writable) {
            (true, true) => write!(f, "read|write"),
            (true, false) => write!(f, "read"),
            (false, true) => write!(f, "write"),
            (false, false) => write!(f, "none"),
        }
    }
}

/// What one wait on the session produced.
pub type Readiness = Result<Event, ConnectionError>;

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Receives the messages of a subscribed session, called from inside [`MqttService::drive`].
pub trait MessageHandler: Send {
    fn on_message(&mut self, message: InboundMessage) -> impl Future<Output = ()> + Send;
}

/// Handler of sessions that only publish.
#[derive(Debug, Default)]
pub struct PublishOnly;

impl MessageHandler for PublishOnly {
    async fn on_message(&mut self, message: InboundMessage) {
        debug!("Ignoring message on topic {} of a publish-only session", message.topic);
    }
}

/// The rumqttc event loop, polled by its own task.
///
/// `EventLoop::poll` must never be dropped half way through a write, so the
/// unit only ever waits on the event channel. After a failed poll the task
/// parks until `resume` is notified.
struct Session {
    events: mpsc::UnboundedReceiver<Readiness>,
    resume: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Session {
    fn spawn(eventloop: EventLoop) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let resume = Arc::new(Notify::new());
        let task = tokio::spawn(poll_session(eventloop, events_tx, resume.clone()));
        Self {
            events,
            resume,
            task,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_session(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<Readiness>,
    resume: Arc<Notify>,
) {
    loop {
        let readiness = eventloop.poll().await;
        let failed = readiness.is_err();
        if events.send(readiness).is_err() {
            return;
        }
        if failed {
            resume.notified().await;
        }
    }
}

/// One MQTT session of a unit.
pub struct MqttService<H> {
    config: MqttConfig,
    client_id: String,
    client_state: ClientState,
    client: Option<AsyncClient>,
    session: Option<Session>,
    handler: H,
    // requests handed to the client but not yet written to the socket
    pending_outbound: usize,
    backoff: ExponentialBackoff,
    next_reconnect: Option<Instant>,
}

impl<H: MessageHandler> MqttService<H> {
    pub fn new(config: MqttConfig, handler: H) -> Result<Self, MqttError> {
        if config.label.is_empty() || config.label.starts_with(char::is_whitespace) {
            return Err(MqttError::InvalidLabel(config.label));
        }
        let suffix = Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-{}", config.label, &suffix[..8]);
        let backoff = reconnect_backoff(config.retry_interval);

        Ok(Self {
            config,
            client_id,
            client_state: ClientState::Disconnected,
            client: None,
            session: None,
            handler,
            pending_outbound: 0,
            backoff,
            next_reconnect: None,
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Connect with up to `connect_attempts` tries, pausing `retry_interval` in between.
    pub async fn connect(&mut self) -> bool {
        info!(
            "Unit [{}]: Connecting to MQTT broker at {}:{}...",
            self.config.label, self.config.broker_host, self.config.broker_port
        );
        self.client_state = ClientState::Connecting;

        let attempts = self.config.connect_attempts;
        for attempt in 1..=attempts {
            match self.try_connect().await {
                Ok(()) => return true,
                Err(e) => {
                    error!("Unit [{}]: {} (attempt {}/{})", self.config.label, e, attempt, attempts);
                    if attempt < attempts {
                        sleep(self.config.retry_interval).await;
                    }
                }
            }
        }

        self.client_state = ClientState::Disconnected;
        self.schedule_reconnect();
        false
    }

    /// Last known connection state.
    pub fn connected(&self) -> bool {
        self.client_state == ClientState::Connected
    }

    /// One reconnect attempt, unless the backoff since the last failure is still running.
    pub async fn reconnect(&mut self) -> bool {
        if self.connected() {
            return true;
        }
        if self.next_reconnect.is_some_and(|at| Instant::now() < at) {
            return false;
        }

        debug!("Unit [{}]: Trying to reconnect...", self.config.label);
        self.client_state = ClientState::Reconnecting;
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Unit [{}]: Reconnect failed: {}", self.config.label, e);
                self.client_state = ClientState::Disconnected;
                self.schedule_reconnect();
                false
            }
        }
    }

    /// Time left until [`reconnect`](Self::reconnect) will try the network again.
    pub fn next_reconnect_in(&self) -> Option<Duration> {
        self.next_reconnect
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Hand a publish to the client. Failures are logged, not retried.
    ///
    /// While connected this waits for room in the client's request queue, at most
    /// [`PUBLISH_TIMEOUT`]. While disconnected it queues without waiting and fails
    /// when the queue is full.
    pub async fn publish(&mut self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS) -> bool {
        info!("Unit [{}]: Publishing on topic {}", self.config.label, topic);
        if topic.is_empty() {
            warn!("Unit [{}]: Refusing to publish on an empty topic", self.config.label);
            return false;
        }
        let Some(client) = self.client.as_ref() else {
            warn!("Unit [{}]: Failed to publish, no MQTT session", self.config.label);
            return false;
        };

        let queued = if self.connected() {
            match timeout(PUBLISH_TIMEOUT, client.publish(topic, qos, false, payload)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err("request queue stalled".to_string()),
            }
        } else {
            client
                .try_publish(topic, qos, false, payload)
                .map_err(|e| e.to_string())
        };

        match queued {
            Ok(()) => {
                self.pending_outbound += 1;
                true
            }
            Err(reason) => {
                warn!("Unit [{}]: Failed to publish, reason: {}", self.config.label, reason);
                false
            }
        }
    }

    /// Informational only: the session task owns the socket, so rumqttc decides
    /// when to write. Write interest reports queued requests not yet written.
    pub fn interest(&self) -> Interest {
        Interest {
            readable: true,
            writable: self.pending_outbound > 0,
        }
    }

    /// Next event reported by the session task. Cancel safe.
    ///
    /// Never resolves without a session, or while a failed session waits for `reconnect`.
    pub async fn readiness(&mut self) -> Readiness {
        let next = match self.session.as_mut() {
            Some(session) => session.events.recv().await,
            None => None,
        };
        match next {
            Some(readiness) => readiness,
            None => std::future::pending().await,
        }
    }

    /// Process one readiness result. A lost connection only flips the state; healing is up to `reconnect`.
    pub async fn drive(&mut self, readiness: Readiness) {
        match readiness {
            Ok(event) => self.handle_event(event).await,
            Err(e) => {
                warn!("Unit [{}]: MQTT disconnect, error: {}", self.config.label, e);
                self.mark_disconnected();
            }
        }
    }

    /// Disconnect politely and release the session.
    pub async fn destroy(mut self) {
        if let (Some(client), true) = (self.client.as_ref(), self.connected()) {
            if client.try_disconnect().is_ok() {
                if let Some(session) = self.session.as_mut() {
                    let _ = timeout(DISCONNECT_GRACE, async {
                        while let Some(readiness) = session.events.recv().await {
                            if matches!(readiness, Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_)) {
                                break;
                            }
                        }
                    })
                    .await;
                }
            }
        }
        debug!("Unit [{}]: MQTT session released", self.config.label);
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                debug!("Unit [{}]: MQTT connect", self.config.label);
                self.client_state = ClientState::Connected;
                self.next_reconnect = None;
                self.backoff = reconnect_backoff(self.config.retry_interval);
                self.subscribe_topic_tree();
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                };
                self.handler.on_message(message).await;
            }
            Event::Incoming(Packet::SubAck(suback)) => {
                info!(
                    "Unit [{}]: Subscribed to topic [{}] (pkid: {}): {:?}",
                    self.config.label,
                    self.config.topic.as_deref().unwrap_or_default(),
                    suback.pkid,
                    suback.return_codes
                );
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Unit [{}]: Broker sent disconnect", self.config.label);
                self.mark_disconnected();
            }
            Event::Outgoing(Outgoing::Publish(_)) | Event::Outgoing(Outgoing::Subscribe(_)) => {
                self.pending_outbound = self.pending_outbound.saturating_sub(1);
            }
            _ => {
                debug!("Unit [{}]: Unhandled event: {:?}", self.config.label, event);
            }
        }
    }

    fn subscribe_topic_tree(&mut self) {
        let Some(topic) = self.config.topic.as_deref() else {
            return;
        };
        let filter = match subscription_filter(topic) {
            Ok(filter) => filter,
            Err(e) => {
                crate::fatal!("Unit [{}]: {}", self.config.label, e);
                return;
            }
        };
        let Some(client) = self.client.as_ref() else {
            return;
        };
        match client.try_subscribe(filter.as_str(), QoS::ExactlyOnce) {
            Ok(()) => self.pending_outbound += 1,
            Err(e) => error!(
                "Unit [{}]: Failed to subscribe to '{}': {}",
                self.config.label, filter, e
            ),
        }
    }

    /// Start the session task, or wake a parked one, and wait for ConnAck or the next failure.
    async fn try_connect(&mut self) -> Result<(), MqttError> {
        if let Some(session) = self.session.as_ref() {
            session.resume.notify_one();
        } else {
            let options = match self.build_options() {
                Ok(options) => options,
                Err(e) => {
                    crate::fatal!("Unit [{}]: Failed to set up TLS, check config! {}", self.config.label, e);
                    return Err(e);
                }
            };
            let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
            self.client = Some(client);
            self.session = Some(Session::spawn(eventloop));
        }

        loop {
            let next = match self.session.as_mut() {
                Some(session) => session.events.recv().await,
                None => None,
            };
            let Some(readiness) = next else {
                return Err(MqttError::Connect {
                    host: self.config.broker_host.clone(),
                    port: self.config.broker_port,
                    reason: "no MQTT session".to_string(),
                });
            };

            let acknowledged = matches!(readiness, Ok(Event::Incoming(Packet::ConnAck(_))));
            let failure = readiness.as_ref().err().map(ToString::to_string);

            self.drive(readiness).await;

            if acknowledged {
                return Ok(());
            }
            if let Some(reason) = failure {
                return Err(MqttError::Connect {
                    host: self.config.broker_host.clone(),
                    port: self.config.broker_port,
                    reason,
                });
            }
        }
    }

    fn build_options(&self) -> Result<MqttOptions, MqttError> {
        let mut options = MqttOptions::new(
            self.client_id.as_str(),
            self.config.broker_host.as_str(),
            self.config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keepalive));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        if self.config.user_pw_auth_enabled {
            options.set_credentials(
                self.config.user.clone().unwrap_or_default(),
                self.config.pw.clone().unwrap_or_default(),
            );
        }
        if self.config.tls_enabled {
            info!("Unit [{}]: Enable MQTT TLS support", self.config.label);
            options.set_transport(tls_transport(&self.config)?);
        }
        Ok(options)
    }

    fn mark_disconnected(&mut self) {
        self.client_state = ClientState::Disconnected;
        self.pending_outbound = 0;
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next().unwrap_or(MAX_RECONNECT_INTERVAL);
        self.next_reconnect = Some(Instant::now() + delay);
    }
}

/// Backoff doubling from `retry_interval` up to one minute.
fn reconnect_backoff(retry_interval: Duration) -> ExponentialBackoff {
    let factor = (retry_interval.as_millis() as u64 / 2).max(1);
    ExponentialBackoff::from_millis(2)
        .factor(factor)
        .max_delay(MAX_RECONNECT_INTERVAL)
}

/// `"<topic>/#"`, rejected when it does not fit [`MAX_TOPIC_LENGTH`].
pub fn subscription_filter(topic: &str) -> Result<String, MqttError> {
    let filter = format!("{}/#", topic);
    if filter.len() >= MAX_TOPIC_LENGTH {
        return Err(MqttError::TopicTooLong(filter));
    }
    Ok(filter)
}

fn tls_transport(config: &MqttConfig) -> Result<Transport, MqttError> {
    let mut ca = Vec::new();
    if let Some(cafile) = config.cafile.as_deref() {
        ca.extend(read_material(cafile)?);
    }
    if let Some(capath) = config.capath.as_deref() {
        ca.extend(read_ca_dir(capath)?);
    }
    if ca.is_empty() {
        let origin = config.cafile.clone().or_else(|| config.capath.clone()).unwrap_or_default();
        return Err(MqttError::NoCaCertificate(origin));
    }

    let client_auth = match (config.certfile.as_deref(), config.keyfile.as_deref()) {
        (Some(cert), Some(key)) => Some((read_material(cert)?, read_material(key)?)),
        (None, None) => None,
        _ => return Err(MqttError::TlsClientAuth),
    };

    Ok(Transport::tls(ca, client_auth, None))
}

fn read_material(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|e| MqttError::TlsMaterial(path.to_path_buf(), e))
}

/// Concatenate the PEM certificates (`.pem`, `.crt`) of a CA directory.
fn read_ca_dir(dir: &Path) -> Result<Vec<u8>, MqttError> {
    let entries = std::fs::read_dir(dir).map_err(|e| MqttError::TlsMaterial(dir.to_path_buf(), e))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "pem" || ext == "crt")
        })
        .collect();
    paths.sort();

    let mut bundle = Vec::new();
    for path in paths {
        bundle.extend(read_material(&path)?);
        bundle.push(b'\n');
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn unreachable_config() -> MqttConfig {
        // port 1 on loopback refuses connections right away
        let broker = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_attempts: 2,
            retry_interval_ms: 100,
            ..Default::default()
        };
        MqttConfig::from_broker("test-unit", Some("root".to_string()), &broker)
    }

    #[test]
    fn rejects_invalid_labels() {
        let mut config = unreachable_config();
        config.label = String::new();
        assert!(matches!(
            MqttService::new(config.clone(), PublishOnly),
            Err(MqttError::InvalidLabel(_))
        ));

        config.label = " padded".to_string();
        assert!(MqttService::new(config, PublishOnly).is_err());
    }

    #[test]
    fn subscription_filter_covers_the_topic_tree() {
        assert_eq!(subscription_filter("root").unwrap(), "root/#");
        let long = "t".repeat(MAX_TOPIC_LENGTH);
        let err = subscription_filter(&long).unwrap_err();
        assert!(matches!(err, MqttError::TopicTooLong(_)));
        assert!(err.to_string().ends_with("the max is 256"));
        let longest = "t".repeat(MAX_TOPIC_LENGTH - 3);
        assert!(subscription_filter(&longest).is_ok());
    }

    #[test]
    fn error_messages_name_the_path() {
        let err = MqttError::TlsMaterial(
            PathBuf::from("/etc/ca.pem"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "Cannot read TLS material /etc/ca.pem: gone");
    }

    #[test]
    fn backoff_starts_at_retry_interval_and_caps() {
        let delays: Vec<Duration> = reconnect_backoff(Duration::from_millis(2000)).take(7).collect();
        assert_eq!(delays[0], Duration::from_millis(2000));
        assert_eq!(delays[1], Duration::from_millis(4000));
        assert_eq!(delays[6], MAX_RECONNECT_INTERVAL);
    }

    #[tokio::test]
    async fn failed_connect_leaves_the_session_disconnected() {
        let mut mqtt = MqttService::new(unreachable_config(), PublishOnly).expect("init");
        assert!(!mqtt.connect().await);
        assert!(!mqtt.connected());
        assert!(mqtt.next_reconnect_in().is_some());

        // still inside the backoff window: no network attempt, no panic
        assert!(!mqtt.reconnect().await);
        assert!(!mqtt.connected());
    }

    #[tokio::test]
    async fn parked_session_reports_nothing() {
        let mut mqtt = MqttService::new(unreachable_config(), PublishOnly).expect("init");
        mqtt.connect().await;
        let waited = timeout(Duration::from_millis(100), mqtt.readiness()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_queued_for_writing() {
        let mut mqtt = MqttService::new(unreachable_config(), PublishOnly).expect("init");
        assert!(!mqtt.publish("dev1/status", b"no session".to_vec(), QoS::AtMostOnce).await);
        assert_eq!(mqtt.interest(), Interest { readable: true, writable: false });

        mqtt.connect().await;
        assert!(mqtt.publish("dev1/status", b"queued".to_vec(), QoS::AtLeastOnce).await);
        assert!(mqtt.interest().writable);
        assert_eq!(mqtt.interest().to_string(), "read|write");
    }

    #[tokio::test]
    async fn empty_topic_is_never_published() {
        let mut mqtt = MqttService::new(unreachable_config(), PublishOnly).expect("init");
        mqtt.connect().await;
        assert!(!mqtt.publish("", b"payload".to_vec(), QoS::AtMostOnce).await);
        assert!(!mqtt.interest().writable);
    }

    #[tokio::test]
    async fn full_queue_fails_fast_while_disconnected() {
        let mut mqtt = MqttService::new(unreachable_config(), PublishOnly).expect("init");
        mqtt.connect().await;
        for _ in 0..REQUEST_CHANNEL_CAPACITY {
            assert!(mqtt.publish("dev1/status", b"x".to_vec(), QoS::AtMostOnce).await);
        }
        assert!(!mqtt.publish("dev1/status", b"x".to_vec(), QoS::AtMostOnce).await);
    }

    #[test]
    fn tls_requires_readable_ca_material() {
        let mut config = unreachable_config();
        config.tls_enabled = true;
        config.cafile = Some(PathBuf::from("/nonexistent/ca.pem"));
        assert!(matches!(tls_transport(&config), Err(MqttError::TlsMaterial(_, _))));
    }

    #[test]
    fn tls_client_auth_needs_cert_and_key() {
        let mut ca = tempfile::NamedTempFile::new().expect("tempfile");
        ca.write_all(b"-----BEGIN CERTIFICATE-----\n").expect("write");

        let mut config = unreachable_config();
        config.tls_enabled = true;
        config.cafile = Some(ca.path().to_path_buf());
        config.certfile = Some(ca.path().to_path_buf());
        assert!(matches!(tls_transport(&config), Err(MqttError::TlsClientAuth)));

        config.certfile = None;
        assert!(tls_transport(&config).is_ok());
    }

    #[test]
    fn ca_dir_bundles_pem_files_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.pem"), b"first").expect("write");
        std::fs::write(dir.path().join("b.crt"), b"second").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"ignored").expect("write");

        let bundle = read_ca_dir(dir.path()).expect("bundle");
        assert_eq!(bundle, b"first\nsecond\n");
    }
}
