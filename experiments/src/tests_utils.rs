use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use bytes::BytesMut;
use stomp::{Command, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::ExperimentConfig;

const TEST_SERVER_ADDR: &str = "127.0.0.1:0";
const CLOSE_WAIT: Duration = Duration::from_secs(2);

/// Headers of a SEND frame that are not copied onto the delivered MESSAGE.
const ROUTING_HEADERS: [&str; 4] = ["destination", "transaction", "receipt", "content-length"];

static ONCE: Once = Once::new();

pub fn init_logs() {
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// An in-process network of STOMP brokers sharing one message store.
///
/// Queue messages go to a consumer on the broker that received them when
/// one matches, otherwise to a matching consumer on any other broker, the
/// way a network of brokers forwards on demand. Topic messages reach every
/// matching subscription. Selectors of the form `key = 'value'`, prefetch
/// limits for client-acknowledged subscriptions, transactions and receipts
/// are honoured.
pub struct StubCluster {
    addrs: Vec<SocketAddr>,
    core: Arc<Mutex<Core>>,
}

impl StubCluster {
    pub async fn start(brokers: usize) -> Self {
        init_logs();
        let core = Arc::new(Mutex::new(Core::default()));
        let mut addrs = Vec::with_capacity(brokers);
        for broker in 0..brokers {
            let listener = TcpListener::bind(TEST_SERVER_ADDR).await.unwrap();
            addrs.push(listener.local_addr().unwrap());
            let core = core.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(core.clone(), broker, stream));
                }
            });
        }
        StubCluster { addrs, core }
    }

    pub fn url(&self, broker: usize) -> String {
        format!("tcp://{}", self.addrs[broker])
    }

    /// Default configuration pointed at this cluster, with short timings.
    pub fn config(&self) -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        for (broker, addr) in config.brokers.iter_mut().zip(&self.addrs) {
            broker.address = format!("tcp://{}", addr);
        }
        config.timings.network_settle_ms = 0;
        config.timings.delivery_timeout_ms = 5_000;
        config.timings.slow_consumer_delay_ms = 300;
        config.timings.connect_timeout_ms = 1_000;
        config.timings.receipt_timeout_ms = 2_000;
        config
    }

    /// Answers every later COMMIT with an ERROR frame carrying `reason`
    /// and drops the transaction.
    pub fn reject_commits(&self, reason: &str) {
        self.core.lock().unwrap().commit_rejection = Some(reason.to_string());
    }

    /// Number of DISCONNECT frames received so far.
    pub fn disconnects(&self) -> usize {
        self.core.lock().unwrap().disconnects
    }

    pub fn open_connections(&self) -> usize {
        self.core.lock().unwrap().connections.len()
    }

    /// Waits until every client connection has been released.
    pub async fn wait_until_idle(&self) -> bool {
        let deadline = tokio::time::Instant::now() + CLOSE_WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.open_connections() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.open_connections() == 0
    }

    /// SEND frames stored for `destination` that no consumer took yet.
    pub fn queued(&self, destination: &str) -> Vec<Frame> {
        self.core
            .lock()
            .unwrap()
            .pending
            .iter()
            .filter(|pending| pending.destination == destination)
            .map(|pending| pending.frame.clone())
            .collect()
    }
}

#[derive(Clone)]
struct Pending {
    broker: usize,
    destination: String,
    message_id: String,
    frame: Frame,
}

struct Subscription {
    connection: u64,
    broker: usize,
    id: String,
    destination: String,
    selector: Option<(String, String)>,
    client_ack: bool,
    prefetch: usize,
    unacked: Vec<Pending>,
}

impl Subscription {
    fn matches(&self, destination: &str, frame: &Frame) -> bool {
        self.destination == destination
            && match &self.selector {
                Some((key, value)) => frame.get(key) == Some(value.as_str()),
                None => true,
            }
    }

    fn has_capacity(&self) -> bool {
        !self.client_ack || self.unacked.len() < self.prefetch
    }
}

#[derive(Default)]
struct Core {
    next_connection: u64,
    next_message: u64,
    round_robin: usize,
    connections: HashMap<u64, mpsc::UnboundedSender<Frame>>,
    subscriptions: Vec<Subscription>,
    transactions: HashMap<(u64, String), Vec<Frame>>,
    pending: VecDeque<Pending>,
    commit_rejection: Option<String>,
    disconnects: usize,
}

fn parse_selector(selector: &str) -> Option<(String, String)> {
    let (key, value) = selector.split_once('=')?;
    Some((
        key.trim().to_string(),
        value.trim().trim_matches('\'').to_string(),
    ))
}

impl Core {
    fn register(&mut self, outbound: mpsc::UnboundedSender<Frame>) -> u64 {
        self.next_connection += 1;
        self.connections.insert(self.next_connection, outbound);
        self.next_connection
    }

    fn reply(&self, connection: u64, frame: Frame) {
        if let Some(outbound) = self.connections.get(&connection) {
            let _ = outbound.send(frame);
        }
    }

    /// Returns false once the client asked to disconnect.
    fn handle(&mut self, connection: u64, broker: usize, frame: Frame) -> bool {
        let transaction = frame.get("transaction").map(str::to_string);
        match frame.command {
            Command::Connect | Command::Stomp => self.reply(
                connection,
                Frame::new(Command::Connected)
                    .header("version", "1.2")
                    .header("server", format!("StubCluster/broker-{}", broker)),
            ),
            Command::Send => match transaction {
                Some(tx) => self
                    .transactions
                    .entry((connection, tx))
                    .or_default()
                    .push(frame.clone()),
                None => self.route(broker, &frame),
            },
            Command::Begin => {
                if let Some(tx) = transaction {
                    self.transactions.insert((connection, tx), Vec::new());
                }
            }
            Command::Commit => {
                let frames = transaction
                    .and_then(|tx| self.transactions.remove(&(connection, tx)))
                    .unwrap_or_default();
                if let Some(reason) = &self.commit_rejection {
                    let mut error = Frame::new(Command::Error).header("message", reason.clone());
                    if let Some(receipt) = frame.get("receipt") {
                        error = error.header("receipt-id", receipt);
                    }
                    self.reply(connection, error);
                    return true;
                }
                for frame in &frames {
                    self.route(broker, frame);
                }
            }
            Command::Abort => {
                if let Some(tx) = transaction {
                    self.transactions.remove(&(connection, tx));
                }
            }
            Command::Subscribe => self.subscriptions.push(Subscription {
                connection,
                broker,
                id: frame.get("id").unwrap_or_default().to_string(),
                destination: frame.get("destination").unwrap_or_default().to_string(),
                selector: frame.get("selector").and_then(parse_selector),
                client_ack: frame.get("ack").is_some_and(|ack| ack != "auto"),
                prefetch: frame
                    .get("activemq.prefetchSize")
                    .and_then(|size| size.parse().ok())
                    .unwrap_or(1000),
                unacked: Vec::new(),
            }),
            Command::Unsubscribe => {
                let id = frame.get("id").unwrap_or_default().to_string();
                self.remove_subscriptions(|s| s.connection == connection && s.id == id);
            }
            Command::Ack => {
                let id = frame.get("id").unwrap_or_default();
                for subscription in &mut self.subscriptions {
                    if subscription.connection == connection {
                        subscription.unacked.retain(|pending| pending.message_id != id);
                    }
                }
            }
            Command::Disconnect => self.disconnects += 1,
            _ => {}
        }

        if let Some(receipt) = frame.get("receipt") {
            self.reply(
                connection,
                Frame::new(Command::Receipt).header("receipt-id", receipt),
            );
        }
        self.dispatch();
        frame.command != Command::Disconnect
    }

    fn drop_connection(&mut self, connection: u64) {
        self.remove_subscriptions(|s| s.connection == connection);
        self.transactions.retain(|(owner, _), _| *owner != connection);
        self.connections.remove(&connection);
        self.dispatch();
    }

    /// Unacknowledged queue messages of removed subscriptions are redelivered.
    fn remove_subscriptions(&mut self, remove: impl Fn(&Subscription) -> bool) {
        let mut kept = Vec::with_capacity(self.subscriptions.len());
        for subscription in self.subscriptions.drain(..) {
            if remove(&subscription) {
                for pending in subscription.unacked.into_iter().rev() {
                    self.pending.push_front(pending);
                }
            } else {
                kept.push(subscription);
            }
        }
        self.subscriptions = kept;
    }

    fn route(&mut self, broker: usize, frame: &Frame) {
        let destination = frame.get("destination").unwrap_or_default().to_string();
        if destination.starts_with("/topic/") {
            for index in 0..self.subscriptions.len() {
                if self.subscriptions[index].matches(&destination, frame) {
                    let pending = self.store(broker, &destination, frame);
                    self.deliver(index, pending, false);
                }
            }
        } else {
            let pending = self.store(broker, &destination, frame);
            self.pending.push_back(pending);
        }
    }

    fn store(&mut self, broker: usize, destination: &str, frame: &Frame) -> Pending {
        self.next_message += 1;
        Pending {
            broker,
            destination: destination.to_string(),
            message_id: format!("ID:stub-{}", self.next_message),
            frame: frame.clone(),
        }
    }

    fn dispatch(&mut self) {
        let mut waiting = VecDeque::new();
        while let Some(pending) = self.pending.pop_front() {
            match self.pick(&pending) {
                Some(index) => self.deliver(index, pending, true),
                None => waiting.push_back(pending),
            }
        }
        self.pending = waiting;
    }

    /// Local consumers first, remote ones otherwise, round-robin within
    /// the chosen group.
    fn pick(&mut self, pending: &Pending) -> Option<usize> {
        let eligible: Vec<usize> = self
            .subscriptions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.matches(&pending.destination, &pending.frame) && s.has_capacity())
            .map(|(index, _)| index)
            .collect();
        let local: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|index| self.subscriptions[*index].broker == pending.broker)
            .collect();
        let candidates = if local.is_empty() { eligible } else { local };
        if candidates.is_empty() {
            return None;
        }
        self.round_robin += 1;
        Some(candidates[self.round_robin % candidates.len()])
    }

    fn deliver(&mut self, index: usize, pending: Pending, track: bool) {
        let subscription = &mut self.subscriptions[index];
        let mut message = Frame::new(Command::Message)
            .header("subscription", subscription.id.clone())
            .header("message-id", pending.message_id.clone())
            .header("destination", pending.destination.clone());
        if subscription.client_ack {
            message = message.header("ack", pending.message_id.clone());
        }
        for (name, value) in &pending.frame.headers {
            if !ROUTING_HEADERS.contains(&name.as_str()) {
                message = message.header(name.clone(), value.clone());
            }
        }
        let message = message.with_body(pending.frame.body.clone());

        let connection = subscription.connection;
        if track && subscription.client_ack {
            subscription.unacked.push(pending);
        }
        self.reply(connection, message);
    }
}

fn handle(core: &Mutex<Core>, connection: u64, broker: usize, frame: Frame) -> bool {
    core.lock().unwrap().handle(connection, broker, frame)
}

async fn serve(core: Arc<Mutex<Core>>, broker: usize, stream: TcpStream) {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let connection = core.lock().unwrap().register(outbound);

    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let mut buffer = BytesMut::new();
            frame.encode(&mut buffer);
            if writer.write_all(&buffer).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut buffer = BytesMut::new();
    'connection: loop {
        while let Ok(Some(frame)) = Frame::decode(&mut buffer) {
            if !handle(&core, connection, broker, frame) {
                break 'connection;
            }
        }
        match reader.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    core.lock().unwrap().drop_connection(connection);
}
