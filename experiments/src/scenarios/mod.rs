//! The broker-network experiments. Every scenario opens its own consumers,
//! produces through [`MessageSender`], waits on a [`DeliveryLog`] and closes
//! everything it opened before returning.

mod priority_failover;
mod selector;
mod slow_consumer;
mod topic_fanout;
mod two_dc_network;

use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use internals::{Destination, Headers, Result};
use stomp::{Connection, ConnectionFactory, Consumer, ConsumerOptions, Session, SessionMode};
use tracing::{info, warn};

use crate::config::ExperimentConfig;
use crate::observer::{DeliveryLog, Observation};
use crate::sender::MessageSender;

pub use priority_failover::priority_failover;
pub use selector::selector;
pub use slow_consumer::slow_consumer;
pub use topic_fanout::topic_fanout;
pub use two_dc_network::two_dc_network;

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub sent: usize,
    pub expected: usize,
    /// False when the delivery timeout elapsed before `expected` observations
    pub completed: bool,
    /// Consumer label and the broker it got attached to
    pub endpoints: Vec<(String, String)>,
    pub observations: Vec<Observation>,
}

impl ScenarioReport {
    pub fn count_for(&self, consumer: &str) -> usize {
        self.observed_by(consumer).count()
    }

    pub fn observed_by<'a>(&'a self, consumer: &'a str) -> impl Iterator<Item = &'a Observation> {
        self.observations
            .iter()
            .filter(move |observation| observation.consumer == consumer)
    }

    pub fn endpoint_of(&self, consumer: &str) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|(label, _)| label == consumer)
            .map(|(_, broker)| broker.as_str())
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: sent {}, observed {}/{}{}",
            self.name,
            self.sent,
            self.observations.len(),
            self.expected,
            if self.completed { "" } else { " (timed out)" }
        )?;
        for (label, broker) in &self.endpoints {
            write!(f, "\n  {} on {}: {}", label, broker, self.count_for(label))?;
        }
        Ok(())
    }
}

/// A consumer to attach for the duration of a scenario.
#[derive(Debug, Clone)]
pub(crate) struct ConsumerPlan {
    pub label: String,
    pub profile: usize,
    pub destination: Destination,
    pub options: ConsumerOptions,
    pub mode: SessionMode,
    pub delay: Option<Duration>,
}

impl ConsumerPlan {
    pub fn new(label: impl Into<String>, profile: usize, destination: Destination) -> Self {
        ConsumerPlan {
            label: label.into(),
            profile,
            destination,
            options: ConsumerOptions::default(),
            mode: SessionMode::AutoAcknowledge,
            delay: None,
        }
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.options = self.options.selector(selector);
        self
    }

    pub fn client_ack(mut self, prefetch: u32) -> Self {
        self.options = self.options.prefetch(prefetch);
        self.mode = SessionMode::ClientAcknowledge;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Connection, session and listening consumer of one [`ConsumerPlan`].
pub(crate) struct ObservingClient {
    label: String,
    broker: String,
    connection: Connection,
    session: Option<Session>,
    consumer: Option<Consumer>,
}

impl ObservingClient {
    async fn open(config: &ExperimentConfig, plan: &ConsumerPlan, log: &DeliveryLog) -> Result<Self> {
        let connection = config
            .connection_factory(plan.profile)?
            .create_connection()
            .await?;
        let broker = config.broker_name(connection.endpoint());

        match Self::attach(&connection, plan, &broker, log).await {
            Ok((session, consumer)) => {
                info!(consumer = %plan.label, %broker, destination = %plan.destination, "consumer attached");
                Ok(ObservingClient {
                    label: plan.label.clone(),
                    broker,
                    connection,
                    session: Some(session),
                    consumer: Some(consumer),
                })
            }
            Err(e) => {
                if let Err(close_error) = connection.close().await {
                    warn!(%close_error, "closing connection after failed attach");
                }
                Err(e)
            }
        }
    }

    async fn attach(
        connection: &Connection,
        plan: &ConsumerPlan,
        broker: &str,
        log: &DeliveryLog,
    ) -> Result<(Session, Consumer)> {
        let session = connection.create_session(plan.mode).await?;
        let mut consumer = session
            .create_consumer_with(&plan.destination, plan.options.clone())
            .await?;
        consumer.set_listener(log.listener(plan.label.clone(), broker, plan.delay))?;
        Ok((session, consumer))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn start(&self) {
        self.connection.start();
    }

    /// Unsubscribes while keeping the connection open.
    pub async fn close_consumer(&mut self) -> Result<()> {
        match self.consumer.take() {
            Some(consumer) => {
                info!(consumer = %self.label, broker = %self.broker, "closing consumer");
                consumer.close().await
            }
            None => Ok(()),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        let consumer = self.close_consumer().await;
        let session = match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        };
        let connection = self.connection.close().await;
        consumer.and(session).and(connection)
    }
}

/// Opens every client in order; already opened ones are closed again when a
/// later one fails.
pub(crate) async fn open_clients(
    config: &ExperimentConfig,
    plans: &[ConsumerPlan],
    log: &DeliveryLog,
) -> Result<Vec<ObservingClient>> {
    let mut clients = Vec::with_capacity(plans.len());
    for plan in plans {
        match ObservingClient::open(config, plan, log).await {
            Ok(client) => clients.push(client),
            Err(e) => {
                if let Err(close_error) = close_clients(clients).await {
                    warn!(%close_error, "closing clients after failed open");
                }
                return Err(e);
            }
        }
    }
    Ok(clients)
}

/// Closes all clients, reporting the first error after attempting each.
pub(crate) async fn close_clients(clients: Vec<ObservingClient>) -> Result<()> {
    let mut result = Ok(());
    for client in clients {
        let closed = client.close().await;
        result = result.and(closed);
    }
    result
}

pub(crate) fn start_all(clients: &[ObservingClient]) {
    for client in clients {
        client.start();
    }
}

/// Lets consumer demand propagate through the broker network.
pub(crate) async fn settle(config: &ExperimentConfig) {
    let pause = config.timings.network_settle();
    if !pause.is_zero() {
        tokio::time::sleep(pause).await;
    }
}

/// Sends `"<prefix> - <n>"` for every `n` in `range`.
pub(crate) async fn send_batch(
    sender: &MessageSender,
    factory: &ConnectionFactory,
    destination: &Destination,
    prefix: &str,
    range: RangeInclusive<usize>,
    headers: Option<&Headers>,
) -> Result<usize> {
    let mut sent = 0;
    for n in range {
        sender
            .send(factory, destination, &format!("{} - {}", prefix, n), headers)
            .await?;
        sent += 1;
    }
    Ok(sent)
}

pub(crate) fn service(name: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert("service".to_string(), name.to_string());
    headers
}

/// Closes the clients whatever the outcome; the scenario error wins over a
/// close error.
pub(crate) async fn finish(
    outcome: Result<ScenarioReport>,
    clients: Vec<ObservingClient>,
) -> Result<ScenarioReport> {
    let closed = close_clients(clients).await;
    let report = outcome?;
    closed?;
    info!("{}", report);
    Ok(report)
}

pub(crate) fn endpoints(clients: &[ObservingClient]) -> Vec<(String, String)> {
    clients
        .iter()
        .map(|client| (client.label().to_string(), client.broker().to_string()))
        .collect()
}

/// Label of a consumer attached through `profile`, e.g. `Consumer A (dc1-amq01)`.
pub(crate) fn consumer_label(config: &ExperimentConfig, name: &str, profile: usize) -> Result<String> {
    Ok(format!("{} ({})", name, config.profile(profile)?.name))
}
