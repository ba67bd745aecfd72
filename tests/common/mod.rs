#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rumqttc::mqttbytes::v4::{
    self, ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec, Publish, SubAck,
    SubscribeReasonCode,
};
use rumqttc::mqttbytes::{Error as CodecError, QoS};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

const MAX_PACKET: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

#[derive(Debug, Default)]
struct BrokerLog {
    connects: usize,
    subscriptions: Vec<String>,
    publishes: Vec<RecordedPublish>,
}

#[derive(Debug, Clone)]
enum Control {
    Packet(Bytes),
    Kick,
}

/// Just enough of an MQTT 3.1.1 broker to accept clients and record their traffic.
pub struct FakeBroker {
    addr: SocketAddr,
    log: Arc<Mutex<BrokerLog>>,
    control: broadcast::Sender<Control>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("bind broker");
        let addr = listener.local_addr().expect("broker addr");
        let log = Arc::new(Mutex::new(BrokerLog::default()));
        let (control, _) = broadcast::channel(64);

        let accept_log = log.clone();
        let accept_control = control.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_client(stream, accept_control.subscribe(), accept_log.clone()));
            }
        });

        Self { addr, log, control }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connects(&self) -> usize {
        self.log.lock().unwrap().connects
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.log.lock().unwrap().subscriptions.clone()
    }

    pub fn publishes(&self) -> Vec<RecordedPublish> {
        self.log.lock().unwrap().publishes.clone()
    }

    /// Send a QoS 0 PUBLISH to every connected client.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        let mut packet = BytesMut::new();
        Publish::new(topic, QoS::AtMostOnce, payload.to_vec())
            .write(&mut packet)
            .expect("encode publish");
        let _ = self.control.send(Control::Packet(packet.freeze()));
    }

    /// Drop every connected client without a DISCONNECT.
    pub fn kick(&self) {
        let _ = self.control.send(Control::Kick);
    }
}

async fn serve_client(
    mut stream: TcpStream,
    mut control: broadcast::Receiver<Control>,
    log: Arc<Mutex<BrokerLog>>,
) {
    let mut read_buf = BytesMut::with_capacity(4096);
    loop {
        loop {
            match v4::read(&mut read_buf, MAX_PACKET) {
                Ok(Packet::Disconnect) => return,
                Ok(packet) => {
                    let mut reply = BytesMut::new();
                    respond(packet, &log, &mut reply);
                    if !reply.is_empty() && stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
                Err(CodecError::InsufficientBytes(_)) => break,
                Err(_) => return,
            }
        }

        tokio::select! {
            read = stream.read_buf(&mut read_buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
            command = control.recv() => match command {
                Ok(Control::Packet(packet)) => {
                    if stream.write_all(&packet).await.is_err() {
                        return;
                    }
                }
                Ok(Control::Kick) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

fn respond(packet: Packet, log: &Mutex<BrokerLog>, reply: &mut BytesMut) {
    let written = match packet {
        Packet::Connect(_) => {
            log.lock().unwrap().connects += 1;
            ConnAck::new(ConnectReturnCode::Success, false).write(reply)
        }
        Packet::Subscribe(subscribe) => {
            let codes = subscribe
                .filters
                .iter()
                .map(|filter| SubscribeReasonCode::Success(filter.qos))
                .collect();
            log.lock()
                .unwrap()
                .subscriptions
                .extend(subscribe.filters.into_iter().map(|filter| filter.path));
            SubAck::new(subscribe.pkid, codes).write(reply)
        }
        Packet::Publish(publish) => {
            log.lock().unwrap().publishes.push(RecordedPublish {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
                qos: publish.qos,
            });
            match publish.qos {
                QoS::AtMostOnce => Ok(0),
                QoS::AtLeastOnce => PubAck::new(publish.pkid).write(reply),
                QoS::ExactlyOnce => PubRec::new(publish.pkid).write(reply),
            }
        }
        Packet::PubRel(pubrel) => PubComp::new(pubrel.pkid).write(reply),
        Packet::PingReq => PingResp.write(reply),
        _ => Ok(0),
    };
    written.expect("encode reply");
}

/// A request seen by [`FakeRestEndpoint`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

/// HTTP endpoint that answers every request with `200 OK` and records it.
pub struct FakeRestEndpoint {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FakeRestEndpoint {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind endpoint");
        let addr = listener.local_addr().expect("endpoint addr");
        let requests = Arc::new(Mutex::new(Vec::new()));

        let accept_requests = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let requests = accept_requests.clone();
                let service = service_fn(move |request| record(request, requests.clone()));
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn record(
    request: Request<Incoming>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let body = request.into_body().collect().await?.to_bytes();
    requests.lock().unwrap().push(RecordedRequest {
        method,
        path,
        body: body.to_vec(),
    });
    Ok(Response::new(Full::new(Bytes::from_static(b"ok"))))
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind port")
        .local_addr()
        .expect("port addr")
        .port()
}
