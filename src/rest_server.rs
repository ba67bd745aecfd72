use crate::mqtt_service::MAX_PACKET_SIZE;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rumqttc::QoS;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Simultaneous HTTP connections served per unit.
pub const MAX_CONNECTIONS: usize = 64;

/// Largest request body accepted; anything bigger could not be published anyway.
pub const MAX_REQUEST_BODY: usize = MAX_PACKET_SIZE;

const OK_BODY: &[u8] = b"OK";
const UNAVAILABLE_BODY: &[u8] = b"Service Unavailable";
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Cannot listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Why a request was answered by closing the connection.
#[derive(Debug, Error)]
pub enum RequestRefused {
    #[error("method {0} is not accepted")]
    Method(Method),
    #[error("request body exceeds {max} bytes", max = MAX_REQUEST_BODY)]
    BodyTooLarge,
    #[error("request path gives an empty topic")]
    EmptyTopic,
    #[error("reading request body failed: {0}")]
    Body(#[from] hyper::Error),
    #[error("unit is shutting down")]
    UnitStopped,
}

/// A completed POST waiting to be published by the unit loop.
#[derive(Debug)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    done: oneshot::Sender<bool>,
}

impl PublishRequest {
    pub fn new(topic: String, payload: Bytes, qos: QoS) -> (Self, oneshot::Receiver<bool>) {
        let (done, receiver) = oneshot::channel();
        (
            Self {
                topic,
                payload,
                qos,
                done,
            },
            receiver,
        )
    }

    /// Report the publish outcome back to the waiting connection.
    pub fn complete(self, published: bool) {
        let _ = self.done.send(published);
    }
}

/// Body accumulator of one POST request.
#[derive(Debug)]
pub struct IncomingRequestBuffer {
    data: BytesMut,
    limit: usize,
}

impl IncomingRequestBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            limit,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) -> Result<(), RequestRefused> {
        if self.data.len() + chunk.len() > self.limit {
            return Err(RequestRefused::BodyTooLarge);
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.data.freeze()
    }
}

/// Topic for a request path: the path without its leading `/`, below `root` when one is set.
pub fn publish_topic(root: Option<&str>, path: &str) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    match root.filter(|root| !root.is_empty()) {
        Some(root) => format!("{}/{}", root.trim_end_matches('/'), path),
        None => path.to_string(),
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid qos value '{0}'")]
pub struct InvalidQos(pub String);

/// QoS from the `qos` query parameter. A missing parameter means QoS 0.
pub fn parse_qos(query: Option<&str>) -> Result<QoS, InvalidQos> {
    let value = query.and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
            .find(|(key, _)| *key == "qos")
            .map(|(_, value)| value)
    });

    match value.map(str::trim) {
        None => Ok(QoS::AtMostOnce),
        Some("0") => Ok(QoS::AtMostOnce),
        Some("1") => Ok(QoS::AtLeastOnce),
        Some("2") => Ok(QoS::ExactlyOnce),
        Some(other) => Err(InvalidQos(other.to_string())),
    }
}

struct RequestContext {
    label: String,
    topic_root: Option<String>,
    requests: mpsc::Sender<PublishRequest>,
}

/// Embedded HTTP server of a REST to MQTT unit.
pub struct RestServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RestServer {
    /// Listen on `0.0.0.0:port` and hand every completed POST to `requests`.
    pub async fn bind(
        label: &str,
        port: u16,
        topic_root: Option<String>,
        requests: mpsc::Sender<PublishRequest>,
        cancel: &CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .map_err(|source| ServerError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { port, source })?;
        info!("Unit [{}]: HTTP server listening on {}", label, local_addr);

        let context = Arc::new(RequestContext {
            label: label.to_string(),
            topic_root,
            requests,
        });
        let shutdown = cancel.child_token();
        let task = tokio::spawn(accept_loop(listener, context, shutdown.clone()));

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Connections already being served run to completion.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!("HTTP accept loop ended abnormally: {}", e);
        }
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<RequestContext>, shutdown: CancellationToken) {
    let connections = Arc::new(Semaphore::new(MAX_CONNECTIONS));

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Ok(permit) = connections.clone().try_acquire_owned() else {
                        crate::fatal!(
                            "Unit [{}]: all {} connection slots busy, refusing {}",
                            context.label, MAX_CONNECTIONS, peer
                        );
                        continue;
                    };
                    tokio::spawn(serve_connection(stream, peer, context.clone(), permit));
                }
                Err(e) => {
                    error!("Unit [{}]: accept failed: {}", context.label, e);
                    sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
        }
    }
    debug!("Unit [{}]: HTTP server stopped", context.label);
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<RequestContext>,
    _permit: OwnedSemaphorePermit,
) {
    let label = context.label.clone();
    let service = service_fn(move |request| handle_request(request, context.clone()));

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!("Unit [{}]: connection from {} closed: {}", label, peer, e);
    }
}

async fn handle_request(
    request: Request<Incoming>,
    context: Arc<RequestContext>,
) -> Result<Response<Full<Bytes>>, RequestRefused> {
    info!(
        "Unit [{}]: CONNECT, url: {}, type: {}, version: {:?}",
        context.label,
        request.uri(),
        request.method(),
        request.version()
    );

    // only POST is served, everything else gets the connection closed
    if request.method() != Method::POST {
        return Err(RequestRefused::Method(request.method().clone()));
    }

    let topic = publish_topic(context.topic_root.as_deref(), request.uri().path());
    if topic.is_empty() {
        return Err(RequestRefused::EmptyTopic);
    }
    let qos = parse_qos(request.uri().query()).unwrap_or_else(|e| {
        warn!("Unit [{}]: {}, falling back to QoS 0", context.label, e);
        QoS::AtMostOnce
    });

    let mut buffer = IncomingRequestBuffer::new(MAX_REQUEST_BODY);
    let mut body = request.into_body();
    while let Some(frame) = body.frame().await {
        if let Ok(chunk) = frame?.into_data() {
            buffer.append(&chunk)?;
        }
    }
    debug!("Unit [{}]: POST body complete, {} bytes", context.label, buffer.len());

    let (publish, done) = PublishRequest::new(topic, buffer.finish(), qos);
    context
        .requests
        .send(publish)
        .await
        .map_err(|_| RequestRefused::UnitStopped)?;
    if !done.await.map_err(|_| RequestRefused::UnitStopped)? {
        warn!("Unit [{}]: publish failed, answering 503", context.label);
        return Ok(unavailable_response());
    }

    Ok(ok_response())
}

fn ok_response() -> Response<Full<Bytes>> {
    html_response(StatusCode::OK, OK_BODY)
}

fn unavailable_response() -> Response<Full<Bytes>> {
    html_response(StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_BODY)
}

fn html_response(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    response
}
