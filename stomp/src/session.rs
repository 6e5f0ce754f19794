use std::sync::{Arc, Mutex};
use std::time::Duration;

use internals::{Destination, Message, ProbeError, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{Shared, PROTOCOL_HEADERS};
use crate::consumer::{AckMode, Consumer, ConsumerOptions};
use crate::frame::{Command, Frame};
use crate::lock;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    AutoAcknowledge,
    ClientAcknowledge,
    /// Sends are grouped in a broker-side transaction until `commit`.
    Transacted,
}

pub struct Session {
    shared: Arc<Shared>,
    mode: SessionMode,
    transaction: Arc<Mutex<Option<String>>>,
}

impl Session {
    pub(crate) async fn open(shared: Arc<Shared>, mode: SessionMode) -> Result<Self> {
        let session = Session {
            shared,
            mode,
            transaction: Arc::new(Mutex::new(None)),
        };
        if mode == SessionMode::Transacted {
            session.begin().await?;
        }
        Ok(session)
    }

    async fn begin(&self) -> Result<()> {
        let transaction = format!("tx-{}", Uuid::new_v4());
        self.shared
            .send_frame(&Frame::new(Command::Begin).header("transaction", transaction.clone()))
            .await?;
        *lock(&self.transaction) = Some(transaction);
        Ok(())
    }

    fn take_transaction(&self, operation: &str) -> Result<String> {
        lock(&self.transaction).take().ok_or_else(|| {
            ProbeError::IllegalState(format!("cannot {} outside a transacted session", operation))
        })
    }

    /// Commits the current transaction and opens the next one.
    pub async fn commit(&self) -> Result<()> {
        let transaction = self.take_transaction("commit")?;
        self.shared
            .request(Frame::new(Command::Commit).header("transaction", transaction.clone()))
            .await?;
        debug!(endpoint=%self.shared.endpoint(), transaction=%transaction, "transaction committed");
        self.begin().await
    }

    pub async fn rollback(&self) -> Result<()> {
        let transaction = self.take_transaction("rollback")?;
        self.shared
            .request(Frame::new(Command::Abort).header("transaction", transaction))
            .await?;
        self.begin().await
    }

    pub fn create_producer(&self, destination: &Destination) -> Producer {
        Producer {
            shared: self.shared.clone(),
            destination: destination.clone(),
            transaction: self.transaction.clone(),
            time_to_live: None,
        }
    }

    pub async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Consumer> {
        let options = ConsumerOptions {
            selector: selector.map(str::to_string),
            ..ConsumerOptions::default()
        };
        self.create_consumer_with(destination, options).await
    }

    pub async fn create_consumer_with(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        let ack_mode = match self.mode {
            SessionMode::ClientAcknowledge => AckMode::ClientIndividual,
            SessionMode::AutoAcknowledge | SessionMode::Transacted => AckMode::Auto,
        };
        Consumer::subscribe(self.shared.clone(), destination, options, ack_mode).await
    }

    /// Rolls back any open transaction.
    pub async fn close(self) -> Result<()> {
        let transaction = lock(&self.transaction).take();
        match transaction {
            Some(transaction) if !self.shared.is_closed() => {
                self.shared
                    .send_frame(&Frame::new(Command::Abort).header("transaction", transaction))
                    .await
            }
            _ => Ok(()),
        }
    }
}

/// Sends messages to one destination. A producer has no broker-side state,
/// so closing it only releases the handle.
pub struct Producer {
    shared: Arc<Shared>,
    destination: Destination,
    transaction: Arc<Mutex<Option<String>>>,
    time_to_live: Option<Duration>,
}

impl Producer {
    pub fn set_time_to_live(&mut self, time_to_live: Duration) {
        self.time_to_live = Some(time_to_live);
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        let mut frame = Frame::new(Command::Send)
            .header("destination", self.destination.to_string())
            .header("content-type", OCTET_STREAM)
            .header("persistent", "true");
        if !message.correlation_id.is_empty() {
            frame = frame.header("correlation-id", message.correlation_id.clone());
        }
        if let Some(time_to_live) = self.time_to_live {
            let expires = utils::current_time_duration() + time_to_live;
            frame = frame.header("expires", expires.as_millis().to_string());
        }
        for (name, value) in &message.headers {
            if PROTOCOL_HEADERS.contains(&name.as_str()) {
                warn!(header=%name, "skipping property that clashes with a protocol header");
                continue;
            }
            frame = frame.header(name.clone(), value.clone());
        }
        let transaction = lock(&self.transaction).clone();
        if let Some(transaction) = transaction {
            frame = frame.header("transaction", transaction);
        }

        self.shared
            .send_frame(&frame.with_body(message.body.clone()))
            .await?;
        debug!(
            destination=%self.destination,
            correlation_id=%message.correlation_id,
            "message sent"
        );
        Ok(())
    }

    pub fn close(self) {
        debug!(destination=%self.destination, "producer closed");
    }
}
