use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use internals::{Headers, ProbeError, ReceivedMessage, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::failover::{Endpoint, FailoverUrl};
use crate::frame::{Command, Frame, CONTENT_LENGTH};
use crate::lock;
use crate::session::{Session, SessionMode};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Headers owned by the protocol; everything else on a MESSAGE frame is an
/// application property.
pub(crate) const PROTOCOL_HEADERS: [&str; 14] = [
    "destination",
    "message-id",
    "subscription",
    "ack",
    "transaction",
    "receipt",
    CONTENT_LENGTH,
    "content-type",
    "correlation-id",
    "expires",
    "persistent",
    "priority",
    "timestamp",
    "redelivered",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub passcode: String,
}

/// Resolves a provider URL to a connected broker.
#[derive(Clone, Debug)]
pub struct ConnectionFactory {
    url: FailoverUrl,
    credentials: Option<Credentials>,
    connect_timeout: Duration,
    receipt_timeout: Duration,
}

impl ConnectionFactory {
    pub fn new(url: FailoverUrl) -> Self {
        ConnectionFactory {
            url,
            credentials: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(url.parse()?))
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    /// Tries every endpoint once, in failover order, and returns the first
    /// that completes the STOMP handshake.
    pub async fn create_connection(&self) -> Result<Connection> {
        let mut attempts = Vec::new();
        for endpoint in self.url.connect_order() {
            let open = Connection::open(&endpoint, self.credentials.as_ref(), self.receipt_timeout);
            match tokio::time::timeout(self.connect_timeout, open).await {
                Ok(Ok(connection)) => {
                    debug!(endpoint=%endpoint, url=%self.url, "connection established");
                    return Ok(connection);
                }
                Ok(Err(err)) => {
                    warn!(endpoint=%endpoint, error=%err, "endpoint unavailable");
                    attempts.push(format!("{}: {}", endpoint, err));
                }
                Err(_) => {
                    warn!(endpoint=%endpoint, "connect timed out");
                    attempts.push(format!("{}: timed out", endpoint));
                }
            }
        }
        Err(ProbeError::NoEndpointReachable {
            url: self.url.to_string(),
            attempts,
        })
    }
}

/// State shared between a connection, its sessions, consumers and the
/// reader task.
pub(crate) struct Shared {
    endpoint: Endpoint,
    writer: AsyncMutex<OwnedWriteHalf>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<ReceivedMessage>>>,
    receipts: Mutex<HashMap<String, oneshot::Sender<Result<()>>>>,
    started: watch::Sender<bool>,
    closed: AtomicBool,
    receipt_timeout: Duration,
}

impl Shared {
    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn started(&self) -> watch::Receiver<bool> {
        self.started.subscribe()
    }

    pub(crate) fn register(&self, subscription: &str, sender: mpsc::UnboundedSender<ReceivedMessage>) {
        lock(&self.subscriptions).insert(subscription.to_string(), sender);
    }

    pub(crate) fn unregister(&self, subscription: &str) {
        lock(&self.subscriptions).remove(subscription);
    }

    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(ProbeError::ConnectionClosed(self.endpoint.to_string()));
        }
        let mut buffer = BytesMut::new();
        frame.encode(&mut buffer);

        let mut writer = self.writer.lock().await;
        writer.write_all(&buffer).await?;
        writer.flush().await?;
        debug!(endpoint=%self.endpoint, command=%frame.command, "frame sent");
        Ok(())
    }

    /// Sends `frame` with a `receipt` header and waits until the broker
    /// confirms it.
    pub(crate) async fn request(&self, frame: Frame) -> Result<()> {
        let receipt_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        lock(&self.receipts).insert(receipt_id.clone(), sender);

        let frame = frame.header("receipt", receipt_id.clone());
        if let Err(err) = self.send_frame(&frame).await {
            lock(&self.receipts).remove(&receipt_id);
            return Err(err);
        }

        match tokio::time::timeout(self.receipt_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProbeError::ConnectionClosed(self.endpoint.to_string())),
            Err(_) => {
                lock(&self.receipts).remove(&receipt_id);
                Err(ProbeError::ReceiptTimeout(receipt_id))
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame.command {
            Command::Message => self.deliver(frame),
            Command::Receipt => {
                let Some(receipt_id) = frame.get("receipt-id") else {
                    warn!(endpoint=%self.endpoint, "receipt without receipt-id");
                    return;
                };
                if let Some(waiter) = lock(&self.receipts).remove(receipt_id) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Command::Error => {
                let message = frame.get("message").unwrap_or("unknown error").to_string();
                let details = String::from_utf8_lossy(&frame.body).into_owned();
                error!(endpoint=%self.endpoint, message=%message, details=%details, "broker error");

                let mut receipts = lock(&self.receipts);
                let waiters: Vec<_> = match frame.get("receipt-id") {
                    Some(receipt_id) => receipts.remove(receipt_id).into_iter().collect(),
                    None => receipts.drain().map(|(_, waiter)| waiter).collect(),
                };
                for waiter in waiters {
                    let _ = waiter.send(Err(ProbeError::Broker {
                        message: message.clone(),
                        details: details.clone(),
                    }));
                }
            }
            other => debug!(endpoint=%self.endpoint, command=%other, "ignoring frame"),
        }
    }

    fn deliver(&self, frame: Frame) {
        let message = received_message(frame);
        let subscriptions = lock(&self.subscriptions);
        match subscriptions.get(&message.subscription) {
            Some(sender) => {
                if sender.send(message).is_err() {
                    debug!(endpoint=%self.endpoint, "consumer dropped before delivery");
                }
            }
            None => debug!(
                endpoint=%self.endpoint,
                subscription=%message.subscription,
                "message for unknown subscription"
            ),
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.subscriptions).clear();
        lock(&self.receipts).clear();
    }
}

fn received_message(frame: Frame) -> ReceivedMessage {
    let header = |name: &str| frame.get(name).map(str::to_string);
    let mut headers = Headers::new();
    for (name, value) in &frame.headers {
        if !PROTOCOL_HEADERS.contains(&name.as_str()) {
            headers.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }

    ReceivedMessage {
        message_id: header("message-id").unwrap_or_default(),
        destination: header("destination").unwrap_or_default(),
        subscription: header("subscription").unwrap_or_default(),
        ack_id: header("ack"),
        correlation_id: header("correlation-id"),
        headers,
        body: frame.body.clone(),
    }
}

fn broker_error(frame: &Frame) -> ProbeError {
    ProbeError::Broker {
        message: frame.get("message").unwrap_or("unknown error").to_string(),
        details: String::from_utf8_lossy(&frame.body).into_owned(),
    }
}

async fn read_frames(shared: &Shared, reader: &mut OwnedReadHalf, buffer: &mut BytesMut) -> Result<()> {
    loop {
        while let Some(frame) = Frame::decode(buffer)? {
            shared.dispatch(frame);
        }
        if reader.read_buf(buffer).await? == 0 {
            return Ok(());
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, mut buffer: BytesMut) {
    match read_frames(&shared, &mut reader, &mut buffer).await {
        Ok(()) => debug!(endpoint=%shared.endpoint, "broker closed the connection"),
        Err(err) => warn!(endpoint=%shared.endpoint, error=%err, "connection reader failed"),
    }
    shared.shutdown();
}

/// A live STOMP connection to one broker endpoint.
///
/// Listeners see no messages until [`Connection::start`] is called.
pub struct Connection {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    server: Option<String>,
}

impl Connection {
    async fn open(
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
        receipt_timeout: Duration,
    ) -> Result<Self> {
        let stream = TcpStream::connect(endpoint.address()).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let mut connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", endpoint.host.clone())
            .header("heart-beat", "0,0");
        if let Some(credentials) = credentials {
            connect = connect
                .header("login", credentials.login.clone())
                .header("passcode", credentials.passcode.clone());
        }
        let mut out = BytesMut::new();
        connect.encode(&mut out);
        writer.write_all(&out).await?;

        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let reply = loop {
            if let Some(frame) = Frame::decode(&mut buffer)? {
                break frame;
            }
            if reader.read_buf(&mut buffer).await? == 0 {
                return Err(ProbeError::ConnectionClosed(endpoint.to_string()));
            }
        };
        match reply.command {
            Command::Connected => {}
            Command::Error => return Err(broker_error(&reply)),
            other => {
                return Err(ProbeError::Frame(format!(
                    "expected CONNECTED, got {}",
                    other
                )))
            }
        }

        let (started, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            endpoint: endpoint.clone(),
            writer: AsyncMutex::new(writer),
            subscriptions: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            started,
            closed: AtomicBool::new(false),
            receipt_timeout,
        });
        let reader = tokio::spawn(read_loop(shared.clone(), reader, buffer));

        info!(
            endpoint=%endpoint,
            server=%reply.get("server").unwrap_or("unknown"),
            "connected"
        );
        Ok(Connection {
            shared,
            reader,
            server: reply.get("server").map(str::to_string),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.shared.endpoint()
    }

    /// Broker product string from the CONNECTED frame.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn start(&self) {
        self.shared.started.send_replace(true);
    }

    pub fn stop(&self) {
        self.shared.started.send_replace(false);
    }

    pub async fn create_session(&self, mode: SessionMode) -> Result<Session> {
        Session::open(self.shared.clone(), mode).await
    }

    /// Disconnects gracefully and releases the socket. A connection the
    /// broker already dropped closes without error.
    pub async fn close(self) -> Result<()> {
        let result = if self.shared.is_closed() {
            Ok(())
        } else {
            self.shared.request(Frame::new(Command::Disconnect)).await
        };

        self.shared.shutdown();
        self.reader.abort();
        let _ = self.shared.writer.lock().await.shutdown().await;
        debug!(endpoint=%self.shared.endpoint, "connection closed");

        match result {
            Err(ProbeError::ConnectionClosed(_)) => Ok(()),
            other => other,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
