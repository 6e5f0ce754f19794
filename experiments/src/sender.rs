use std::time::Duration;

use internals::{Destination, Headers, Message, Result};
use stomp::{Connection, ConnectionFactory, SessionMode};
use tracing::debug;
use utils::random_payload;

use crate::config::MessageConfig;

/// Sends single messages over a transient connection: every call opens its
/// own connection and transacted session and closes both before returning.
#[derive(Debug, Clone)]
pub struct MessageSender {
    payload_bytes: usize,
    time_to_live: Duration,
}

impl Default for MessageSender {
    fn default() -> Self {
        MessageSender::from_config(&MessageConfig::default())
    }
}

impl MessageSender {
    pub fn new(payload_bytes: usize, time_to_live: Duration) -> Self {
        MessageSender {
            payload_bytes,
            time_to_live,
        }
    }

    pub fn from_config(config: &MessageConfig) -> Self {
        MessageSender::new(
            config.payload_bytes,
            Duration::from_millis(config.time_to_live_ms),
        )
    }

    pub async fn send(
        &self,
        factory: &ConnectionFactory,
        destination: &Destination,
        correlation_id: &str,
        headers: Option<&Headers>,
    ) -> Result<()> {
        let connection = factory.create_connection().await?;
        let sent = self
            .send_on(&connection, destination, correlation_id, headers)
            .await;
        let closed = connection.close().await;
        if sent.is_ok() {
            debug!(%destination, correlation_id, "message sent");
        }
        sent.and(closed)
    }

    async fn send_on(
        &self,
        connection: &Connection,
        destination: &Destination,
        correlation_id: &str,
        headers: Option<&Headers>,
    ) -> Result<()> {
        let session = connection.create_session(SessionMode::Transacted).await?;

        let mut producer = session.create_producer(destination);
        producer.set_time_to_live(self.time_to_live);

        let mut message = Message::new(correlation_id, random_payload(self.payload_bytes));
        if let Some(headers) = headers {
            message = message.with_headers(headers);
        }

        let sent = match producer.send(&message).await {
            Ok(()) => session.commit().await,
            Err(e) => Err(e),
        };
        producer.close();
        let closed = session.close().await;
        sent.and(closed)
    }
}
