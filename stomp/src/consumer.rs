use std::sync::Arc;

use async_trait::async_trait;
use internals::{Destination, ProbeError, ReceivedMessage, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::connection::Shared;
use crate::frame::{Command, Frame};

const PREFETCH_HEADER: &str = "activemq.prefetchSize";

/// Callback invoked for every delivery once the connection is started.
///
/// Errors are logged and the message is considered handled; nothing is
/// redelivered on the client side.
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, message: &ReceivedMessage) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Broker-evaluated filter, e.g. `service = 'A'`
    pub selector: Option<String>,
    /// Maximum number of unacknowledged messages pushed to this consumer
    pub prefetch: Option<u32>,
}

impl ConsumerOptions {
    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = Some(prefetch);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AckMode {
    Auto,
    ClientIndividual,
}

impl AckMode {
    fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

pub struct Consumer {
    shared: Arc<Shared>,
    id: String,
    destination: Destination,
    ack_mode: AckMode,
    receiver: Option<mpsc::UnboundedReceiver<ReceivedMessage>>,
    listener: Option<JoinHandle<()>>,
    /// Dropping it stops the listener as well
    stopping: watch::Sender<bool>,
}

impl Consumer {
    pub(crate) async fn subscribe(
        shared: Arc<Shared>,
        destination: &Destination,
        options: ConsumerOptions,
        ack_mode: AckMode,
    ) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        shared.register(&id, sender);

        let mut frame = Frame::new(Command::Subscribe)
            .header("id", id.clone())
            .header("destination", destination.to_string())
            .header("ack", ack_mode.as_str());
        if let Some(selector) = &options.selector {
            frame = frame.header("selector", selector.clone());
        }
        if let Some(prefetch) = options.prefetch {
            frame = frame.header(PREFETCH_HEADER, prefetch.to_string());
        }

        if let Err(err) = shared.request(frame).await {
            shared.unregister(&id);
            return Err(err);
        }
        info!(
            endpoint=%shared.endpoint(),
            destination=%destination,
            selector=?options.selector,
            prefetch=?options.prefetch,
            "consumer subscribed"
        );

        Ok(Consumer {
            shared,
            id,
            destination: destination.clone(),
            ack_mode,
            receiver: Some(receiver),
            listener: None,
            stopping: watch::channel(false).0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hands deliveries to `listener` on a dedicated task. In client
    /// acknowledge sessions each message is acknowledged after the listener
    /// returns, whatever its outcome. Closing the consumer interrupts a
    /// listener call but never an acknowledgement being written.
    pub fn set_listener(&mut self, listener: Arc<dyn MessageListener>) -> Result<()> {
        let mut receiver = self
            .receiver
            .take()
            .ok_or_else(|| ProbeError::IllegalState("consumer already has a listener".to_string()))?;
        let shared = self.shared.clone();
        let ack_mode = self.ack_mode;
        let subscription = self.id.clone();
        let mut started = shared.started();
        let mut stopping = self.stopping.subscribe();

        self.listener = Some(tokio::spawn(async move {
            loop {
                let handled = tokio::select! {
                    _ = stopping.changed() => break,
                    handled = next_delivery(&mut receiver, &mut started, listener.as_ref()) => handled,
                };
                let Some((message, handled)) = handled else {
                    break;
                };
                if let Err(err) = handled {
                    error!(
                        subscription=%subscription,
                        message_id=%message.message_id,
                        error=%err,
                        "message listener failed"
                    );
                }
                if ack_mode == AckMode::ClientIndividual {
                    if let Err(err) = acknowledge(&shared, &message).await {
                        error!(subscription=%subscription, error=%err, "acknowledge failed");
                        break;
                    }
                }
            }
            debug!(subscription=%subscription, "listener stopped");
        }));
        Ok(())
    }

    /// Pulls the next delivery, waiting for the connection to be started.
    /// Returns `None` once the connection is gone.
    pub async fn recv(&mut self) -> Result<Option<ReceivedMessage>> {
        let receiver = self.receiver.as_mut().ok_or_else(|| {
            ProbeError::IllegalState("consumer is driven by a listener".to_string())
        })?;
        let Some(message) = receiver.recv().await else {
            return Ok(None);
        };
        let mut started = self.shared.started();
        if started.wait_for(|started| *started).await.is_err() {
            return Ok(None);
        }
        Ok(Some(message))
    }

    pub async fn acknowledge(&self, message: &ReceivedMessage) -> Result<()> {
        match self.ack_mode {
            AckMode::Auto => Ok(()),
            AckMode::ClientIndividual => acknowledge(&self.shared, message).await,
        }
    }

    /// Stops the listener and removes the subscription from the broker.
    /// Unacknowledged messages become available to other consumers.
    pub async fn close(mut self) -> Result<()> {
        if let Some(listener) = self.listener.take() {
            self.stopping.send_replace(true);
            if let Err(err) = listener.await {
                error!(subscription=%self.id, error=%err, "listener task failed");
            }
        }
        self.shared.unregister(&self.id);
        if self.shared.is_closed() {
            return Ok(());
        }
        self.shared
            .request(Frame::new(Command::Unsubscribe).header("id", self.id.clone()))
            .await?;
        info!(endpoint=%self.shared.endpoint(), destination=%self.destination, "consumer closed");
        Ok(())
    }
}

/// Waits for the next delivery and runs the listener on it once the
/// connection is started. `None` when the connection is gone.
async fn next_delivery(
    receiver: &mut mpsc::UnboundedReceiver<ReceivedMessage>,
    started: &mut watch::Receiver<bool>,
    listener: &dyn MessageListener,
) -> Option<(ReceivedMessage, Result<()>)> {
    let message = receiver.recv().await?;
    if started.wait_for(|started| *started).await.is_err() {
        return None;
    }
    let handled = listener.on_message(&message).await;
    Some((message, handled))
}

async fn acknowledge(shared: &Shared, message: &ReceivedMessage) -> Result<()> {
    let ack_id = message.ack_id.as_deref().ok_or_else(|| {
        ProbeError::Frame(format!("message {} carries no ack header", message.message_id))
    })?;
    shared
        .send_frame(&Frame::new(Command::Ack).header("id", ack_id))
        .await
}
