use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use internals::{Destination, Message, ProbeError, ReceivedMessage, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::tests_utils::{message_frame, Behaviour, ScriptedBroker};
use super::*;

struct ChannelListener {
    deliveries: mpsc::UnboundedSender<ReceivedMessage>,
    fail: bool,
}

#[async_trait]
impl MessageListener for ChannelListener {
    async fn on_message(&self, message: &ReceivedMessage) -> Result<()> {
        let _ = self.deliveries.send(message.clone());
        if self.fail {
            return Err(ProbeError::Listener("simulated failure".to_string()));
        }
        Ok(())
    }
}

fn channel_listener(fail: bool) -> (Arc<ChannelListener>, mpsc::UnboundedReceiver<ReceivedMessage>) {
    let (deliveries, receiver) = mpsc::unbounded_channel();
    (Arc::new(ChannelListener { deliveries, fail }), receiver)
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_connect_and_close() {
    let mut broker = ScriptedBroker::start(Behaviour::Accept).await;
    let factory = ConnectionFactory::from_url(&broker.url()).unwrap();

    let connection = factory.create_connection().await.unwrap();
    assert_eq!(connection.endpoint().port, broker.addr.port());
    assert_eq!(connection.server(), Some("ScriptedBroker/1.0"));

    let connect = broker.expect(Command::Connect).await;
    assert_eq!(connect.get("accept-version"), Some("1.2"));
    assert_eq!(connect.get("host"), Some("127.0.0.1"));

    connection.close().await.unwrap();
    let disconnect = broker.expect(Command::Disconnect).await;
    assert!(disconnect.get("receipt").is_some());
}

#[tokio::test]
async fn test_credentials_sent_on_connect() {
    let mut broker = ScriptedBroker::start(Behaviour::Accept).await;
    let factory = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .with_credentials(Some(Credentials {
            login: "admin".to_string(),
            passcode: "admin".to_string(),
        }));

    let connection = factory.create_connection().await.unwrap();
    let connect = broker.expect(Command::Connect).await;
    assert_eq!(connect.get("login"), Some("admin"));
    assert_eq!(connect.get("passcode"), Some("admin"));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_failover_skips_unreachable_endpoint() {
    let broker = ScriptedBroker::start(Behaviour::Accept).await;
    let dead = unused_port().await;
    let url = format!(
        "failover:(tcp://127.0.0.1:{},{})?randomize=false",
        dead,
        broker.url()
    );

    let connection = ConnectionFactory::from_url(&url)
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    assert_eq!(connection.endpoint().port, broker.addr.port());
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_priority_endpoint_preferred() {
    let primary = ScriptedBroker::start(Behaviour::Accept).await;
    let backup = ScriptedBroker::start(Behaviour::Accept).await;
    let url = format!(
        "failover:({},{})?randomize=false&priorityBackup=true&priorityURIs={}",
        backup.url(),
        primary.url(),
        primary.url()
    );

    let connection = ConnectionFactory::from_url(&url)
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    assert_eq!(connection.endpoint().port, primary.addr.port());
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_no_endpoint_reachable() {
    let dead = unused_port().await;
    let err = ConnectionFactory::from_url(&format!("tcp://127.0.0.1:{}", dead))
        .unwrap()
        .create_connection()
        .await
        .err()
        .expect("connecting to a closed port should fail");

    match err {
        ProbeError::NoEndpointReachable { attempts, .. } => assert_eq!(attempts.len(), 1),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_connect_rejected_by_broker() {
    let broker = ScriptedBroker::start(Behaviour::RejectConnect("User name is invalid")).await;
    let err = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .err()
        .expect("rejected handshake should fail");

    assert!(err.to_string().contains("User name is invalid"), "{}", err);
}

#[tokio::test]
async fn test_transacted_send() {
    let mut broker = ScriptedBroker::start(Behaviour::Accept).await;
    let connection = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .unwrap();

    let session = connection.create_session(SessionMode::Transacted).await.unwrap();
    let begin = broker.expect(Command::Begin).await;
    let transaction = begin.get("transaction").unwrap().to_string();

    let mut producer = session.create_producer(&Destination::queue("REQUEST"));
    producer.set_time_to_live(Duration::from_secs(30));
    let message = Message::new("Message to A from dc1-amq01 - 1", Bytes::from(vec![7u8; 10_000]))
        .with_header("service", "A");
    producer.send(&message).await.unwrap();
    producer.close();
    session.commit().await.unwrap();

    let send = broker.expect(Command::Send).await;
    assert_eq!(send.get("destination"), Some("/queue/REQUEST"));
    assert_eq!(send.get("correlation-id"), Some("Message to A from dc1-amq01 - 1"));
    assert_eq!(send.get("service"), Some("A"));
    assert_eq!(send.get("transaction"), Some(transaction.as_str()));
    assert_eq!(send.get("content-length"), Some("10000"));
    assert_eq!(send.body.len(), 10_000);

    let expires: u128 = send.get("expires").unwrap().parse().unwrap();
    assert!(expires > utils::current_time_duration().as_millis());

    let commit = broker.expect(Command::Commit).await;
    assert_eq!(commit.get("transaction"), Some(transaction.as_str()));

    let next = broker.expect(Command::Begin).await;
    assert_ne!(next.get("transaction"), Some(transaction.as_str()));

    session.close().await.unwrap();
    broker.expect(Command::Abort).await;
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_outside_transaction_fails() {
    let broker = ScriptedBroker::start(Behaviour::Accept).await;
    let connection = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    let session = connection
        .create_session(SessionMode::AutoAcknowledge)
        .await
        .unwrap();

    assert!(matches!(
        session.commit().await,
        Err(ProbeError::IllegalState(_))
    ));
    session.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_listener_waits_for_start() {
    let mut broker = ScriptedBroker::start(Behaviour::Accept).await;
    let connection = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    let session = connection
        .create_session(SessionMode::AutoAcknowledge)
        .await
        .unwrap();
    let mut consumer = session
        .create_consumer(&Destination::queue("REQUEST"), Some("service = 'A'"))
        .await
        .unwrap();

    let subscribe = broker.expect(Command::Subscribe).await;
    assert_eq!(subscribe.get("selector"), Some("service = 'A'"));
    assert_eq!(subscribe.get("ack"), Some("auto"));
    assert_eq!(subscribe.get("id"), Some(consumer.id()));

    let (listener, mut deliveries) = channel_listener(false);
    consumer.set_listener(listener).unwrap();
    broker.push(
        message_frame(consumer.id(), "ID:1")
            .header("correlation-id", "Message to A - 1")
            .header("service", "A")
            .with_body(Bytes::from_static(b"payload")),
    );

    let early = tokio::time::timeout(Duration::from_millis(200), deliveries.recv()).await;
    assert!(early.is_err(), "listener ran before the connection started");

    connection.start();
    let delivered = tokio::time::timeout(Duration::from_secs(2), deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.correlation_id.as_deref(), Some("Message to A - 1"));
    assert_eq!(delivered.header("service"), Some("A"));
    assert_eq!(delivered.destination, "/queue/REQUEST");
    assert_eq!(delivered.body, Bytes::from_static(b"payload"));

    consumer.close().await.unwrap();
    let unsubscribe = broker.expect(Command::Unsubscribe).await;
    assert_eq!(unsubscribe.get("id"), subscribe.get("id"));
    session.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_client_ack_after_listener_error() {
    let mut broker = ScriptedBroker::start(Behaviour::Accept).await;
    let connection = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    let session = connection
        .create_session(SessionMode::ClientAcknowledge)
        .await
        .unwrap();
    let mut consumer = session
        .create_consumer_with(
            &Destination::queue("REQUEST"),
            ConsumerOptions::default().prefetch(1),
        )
        .await
        .unwrap();

    let subscribe = broker.expect(Command::Subscribe).await;
    assert_eq!(subscribe.get("ack"), Some("client-individual"));
    assert_eq!(subscribe.get("activemq.prefetchSize"), Some("1"));

    let (listener, mut deliveries) = channel_listener(true);
    consumer.set_listener(listener).unwrap();
    connection.start();
    broker.push(message_frame(consumer.id(), "ID:7").header("ack", "ack-7"));

    tokio::time::timeout(Duration::from_secs(2), deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    let ack = broker.expect(Command::Ack).await;
    assert_eq!(ack.get("id"), Some("ack-7"));

    consumer.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_pull_consumer() {
    let broker = ScriptedBroker::start(Behaviour::Accept).await;
    let connection = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    let session = connection
        .create_session(SessionMode::AutoAcknowledge)
        .await
        .unwrap();
    let mut consumer = session
        .create_consumer(&Destination::topic("EVENTS"), None)
        .await
        .unwrap();

    connection.start();
    broker.push(message_frame(consumer.id(), "ID:3").header("correlation-id", "event-3"));
    let message = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(message.correlation_id.as_deref(), Some("event-3"));

    let (listener, _deliveries) = channel_listener(false);
    consumer.set_listener(listener).unwrap();
    assert!(matches!(
        consumer.recv().await,
        Err(ProbeError::IllegalState(_))
    ));

    consumer.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_rejected_by_broker() {
    let broker = ScriptedBroker::start(Behaviour::RejectSubscribe("Invalid selector")).await;
    let connection = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    let session = connection
        .create_session(SessionMode::AutoAcknowledge)
        .await
        .unwrap();

    let err = session
        .create_consumer(&Destination::queue("REQUEST"), Some("service = "))
        .await
        .err()
        .expect("rejected subscription should fail");
    match err {
        ProbeError::Broker { message, .. } => assert_eq!(message, "Invalid selector"),
        other => panic!("unexpected error: {}", other),
    }
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_rollback_opens_new_transaction() {
    let mut broker = ScriptedBroker::start(Behaviour::Accept).await;
    let connection = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    let session = connection.create_session(SessionMode::Transacted).await.unwrap();
    let begin = broker.expect(Command::Begin).await;

    session.rollback().await.unwrap();
    let abort = broker.expect(Command::Abort).await;
    assert_eq!(abort.get("transaction"), begin.get("transaction"));
    let next = broker.expect(Command::Begin).await;
    assert_ne!(next.get("transaction"), begin.get("transaction"));

    session.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_stop_holds_back_delivery() {
    let broker = ScriptedBroker::start(Behaviour::Accept).await;
    let connection = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    let session = connection
        .create_session(SessionMode::AutoAcknowledge)
        .await
        .unwrap();
    let mut consumer = session
        .create_consumer(&Destination::queue("REQUEST"), None)
        .await
        .unwrap();
    let (listener, mut deliveries) = channel_listener(false);
    consumer.set_listener(listener).unwrap();

    connection.start();
    connection.stop();
    broker.push(message_frame(consumer.id(), "ID:5").header("correlation-id", "held"));

    let held = tokio::time::timeout(Duration::from_millis(200), deliveries.recv()).await;
    assert!(held.is_err(), "listener ran on a stopped connection");

    connection.start();
    let delivered = tokio::time::timeout(Duration::from_secs(2), deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.correlation_id.as_deref(), Some("held"));

    consumer.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_close_writes_pending_ack_before_unsubscribe() {
    let mut broker = ScriptedBroker::start(Behaviour::Accept).await;
    let connection = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    let session = connection
        .create_session(SessionMode::ClientAcknowledge)
        .await
        .unwrap();
    let mut consumer = session
        .create_consumer(&Destination::queue("REQUEST"), None)
        .await
        .unwrap();
    broker.expect(Command::Subscribe).await;

    let (listener, mut deliveries) = channel_listener(false);
    consumer.set_listener(listener).unwrap();
    connection.start();
    broker.push(message_frame(consumer.id(), "ID:8").header("ack", "ack-8"));
    tokio::time::timeout(Duration::from_secs(2), deliveries.recv())
        .await
        .unwrap()
        .unwrap();

    // the listener has returned; its acknowledgement must reach the broker
    consumer.close().await.unwrap();
    let ack = broker.next_frame().await;
    assert_eq!(ack.command, Command::Ack);
    assert_eq!(ack.get("id"), Some("ack-8"));
    assert_eq!(broker.next_frame().await.command, Command::Unsubscribe);

    connection.close().await.unwrap();
}

struct StalledListener {
    entered: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl MessageListener for StalledListener {
    async fn on_message(&self, message: &ReceivedMessage) -> Result<()> {
        let _ = self.entered.send(message.message_id.clone());
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_close_interrupts_running_listener() {
    let mut broker = ScriptedBroker::start(Behaviour::Accept).await;
    let connection = ConnectionFactory::from_url(&broker.url())
        .unwrap()
        .create_connection()
        .await
        .unwrap();
    let session = connection
        .create_session(SessionMode::ClientAcknowledge)
        .await
        .unwrap();
    let mut consumer = session
        .create_consumer(&Destination::queue("REQUEST"), None)
        .await
        .unwrap();
    broker.expect(Command::Subscribe).await;

    let (entered, mut entries) = mpsc::unbounded_channel();
    consumer.set_listener(Arc::new(StalledListener { entered })).unwrap();
    connection.start();
    broker.push(message_frame(consumer.id(), "ID:9").header("ack", "ack-9"));
    let entered = tokio::time::timeout(Duration::from_secs(2), entries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entered, "ID:9");

    tokio::time::timeout(Duration::from_secs(2), consumer.close())
        .await
        .expect("close waited for a stalled listener")
        .unwrap();
    // the interrupted message stays unacknowledged
    assert_eq!(broker.next_frame().await.command, Command::Unsubscribe);

    connection.close().await.unwrap();
}
