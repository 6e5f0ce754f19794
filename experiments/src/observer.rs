use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use internals::{Headers, ProbeError, ReceivedMessage, Result};
use stomp::MessageListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;

/// One delivery as seen by an observing consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub consumer: String,
    pub broker: String,
    pub correlation_id: String,
    pub headers: Headers,
    pub payload_len: usize,
}

impl Observation {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

pub struct ObservingListener {
    consumer: String,
    broker: String,
    delay: Option<Duration>,
    observations: mpsc::UnboundedSender<Observation>,
}

#[async_trait]
impl MessageListener for ObservingListener {
    async fn on_message(&self, message: &ReceivedMessage) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let correlation_id = message.correlation_id.clone().unwrap_or_default();
        let mut line = format!("{} processed message \"{}\"", self.consumer, correlation_id);
        for (key, value) in &message.headers {
            line.push_str(&format!("; {} = {}", key, value));
        }
        println!("{}", line);

        let observation = Observation {
            consumer: self.consumer.clone(),
            broker: self.broker.clone(),
            correlation_id,
            headers: message.headers.clone(),
            payload_len: message.body.len(),
        };
        self.observations.send(observation).map_err(|_| {
            ProbeError::Listener(format!("{}: delivery log is gone", self.consumer))
        })
    }
}

/// Collects observations from every listener of a scenario.
pub struct DeliveryLog {
    sender: mpsc::UnboundedSender<Observation>,
    receiver: mpsc::UnboundedReceiver<Observation>,
    observations: Vec<Observation>,
}

impl Default for DeliveryLog {
    fn default() -> Self {
        DeliveryLog::new()
    }
}

impl DeliveryLog {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        DeliveryLog {
            sender,
            receiver,
            observations: Vec::new(),
        }
    }

    pub fn listener(
        &self,
        consumer: impl Into<String>,
        broker: impl Into<String>,
        delay: Option<Duration>,
    ) -> Arc<ObservingListener> {
        Arc::new(ObservingListener {
            consumer: consumer.into(),
            broker: broker.into(),
            delay,
            observations: self.sender.clone(),
        })
    }

    /// Waits until at least `expected` observations arrived in total.
    /// Returns false when `timeout` elapsed first.
    pub async fn wait_for(&mut self, expected: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.observations.len() < expected {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(observation)) => self.observations.push(observation),
                // unreachable while self holds a sender
                Ok(None) => break,
                Err(_) => {
                    info!(
                        expected,
                        observed = self.observations.len(),
                        "timed out waiting for deliveries"
                    );
                    return false;
                }
            }
        }
        self.observations.len() >= expected
    }

    /// Moves every observation that already arrived into the log.
    pub fn drain(&mut self) -> usize {
        let mut moved = 0;
        while let Ok(observation) = self.receiver.try_recv() {
            self.observations.push(observation);
            moved += 1;
        }
        moved
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn count_for(&self, consumer: &str) -> usize {
        self.observations
            .iter()
            .filter(|observation| observation.consumer == consumer)
            .count()
    }

    pub fn into_observations(mut self) -> Vec<Observation> {
        self.drain();
        self.observations
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn received(correlation_id: &str, service: &str) -> ReceivedMessage {
        let mut headers = Headers::new();
        headers.insert("service".to_string(), service.to_string());
        ReceivedMessage {
            message_id: format!("ID:{}", correlation_id),
            destination: "/queue/REQUEST".to_string(),
            subscription: "sub-0".to_string(),
            ack_id: None,
            correlation_id: Some(correlation_id.to_string()),
            headers,
            body: Bytes::from_static(&[7; 16]),
        }
    }

    #[tokio::test]
    async fn test_wait_for_counts_observations() {
        let mut log = DeliveryLog::new();
        let a = log.listener("Consumer A (dc1-amq01)", "dc1-amq01", None);
        let b = log.listener("Consumer B (dc1-amq02)", "dc1-amq02", None);

        a.on_message(&received("m-1", "A")).await.unwrap();
        a.on_message(&received("m-2", "A")).await.unwrap();
        b.on_message(&received("m-3", "B")).await.unwrap();

        assert!(log.wait_for(3, Duration::from_secs(1)).await);
        assert_eq!(log.count_for("Consumer A (dc1-amq01)"), 2);
        assert_eq!(log.count_for("Consumer B (dc1-amq02)"), 1);

        let third = &log.observations()[2];
        assert_eq!(third.broker, "dc1-amq02");
        assert_eq!(third.header("service"), Some("B"));
        assert_eq!(third.payload_len, 16);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let mut log = DeliveryLog::new();
        let listener = log.listener("Consumer", "dc1-amq01", None);
        listener.on_message(&received("m-1", "A")).await.unwrap();

        let started = Instant::now();
        assert!(!log.wait_for(2, Duration::from_millis(100)).await);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(log.observations().len(), 1);
    }

    #[tokio::test]
    async fn test_listener_fails_without_log() {
        let listener = DeliveryLog::new().listener("Orphan", "dc1-amq01", None);
        let result = listener.on_message(&received("m-1", "A")).await;
        assert!(matches!(result, Err(ProbeError::Listener(_))));
    }

    #[tokio::test]
    async fn test_drain_and_delay() {
        let log = DeliveryLog::new();
        let slow = log.listener("Slow", "dc1-amq01", Some(Duration::from_millis(50)));

        let started = Instant::now();
        slow.on_message(&received("m-1", "A")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        let observations = log.into_observations();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].correlation_id, "m-1");
    }
}
