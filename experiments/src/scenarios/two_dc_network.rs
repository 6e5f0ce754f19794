use internals::{ProbeError, Result};
use tracing::info;

use super::{
    consumer_label, endpoints, finish, open_clients, send_batch, service, settle, start_all,
    ConsumerPlan, ObservingClient, ScenarioReport,
};
use crate::config::ExperimentConfig;
use crate::observer::DeliveryLog;
use crate::sender::MessageSender;

const FIRST_BATCH: usize = 5;
const SECOND_BATCH: usize = 5;
const B_MESSAGES: usize = 10;

/// Consumers for services A and B in both data centers. After the first
/// batch for A the consumer on the first broker goes away, and the rest of
/// A's messages must be forwarded to the other data center.
pub async fn two_dc_network(config: &ExperimentConfig) -> Result<ScenarioReport> {
    if config.profiles.len() < 4 {
        return Err(ProbeError::Config(format!(
            "two_dc_network needs four client profiles, {} configured",
            config.profiles.len()
        )));
    }

    let queue = config.request_queue();
    let mut plans = Vec::with_capacity(4);
    for (profile, name) in ["A", "B", "A", "B"].into_iter().enumerate() {
        plans.push(
            ConsumerPlan::new(
                consumer_label(config, &format!("Consumer {}", name), profile)?,
                profile,
                queue.clone(),
            )
            .selector(format!("service = '{}'", name)),
        );
    }

    let mut log = DeliveryLog::new();
    let mut clients = open_clients(config, &plans, &log).await?;
    let outcome = drive(config, &mut clients, &mut log).await;
    finish(outcome, clients).await
}

async fn drive(
    config: &ExperimentConfig,
    clients: &mut [ObservingClient],
    log: &mut DeliveryLog,
) -> Result<ScenarioReport> {
    start_all(clients);
    settle(config).await;

    let origin = &config.profile(0)?.name;
    let sender = MessageSender::from_config(&config.message);
    let factory = config.connection_factory(0)?;
    let queue = config.request_queue();
    let a_prefix = format!("Message to A from {}", origin);
    let timeout = config.timings.delivery_timeout();

    let mut sent = send_batch(
        &sender,
        &factory,
        &queue,
        &a_prefix,
        1..=FIRST_BATCH,
        Some(&service("A")),
    )
    .await?;
    log.wait_for(sent, timeout).await;

    info!("Closing {}", clients[0].label());
    clients[0].close_consumer().await?;
    settle(config).await;

    sent += send_batch(
        &sender,
        &factory,
        &queue,
        &a_prefix,
        FIRST_BATCH + 1..=FIRST_BATCH + SECOND_BATCH,
        Some(&service("A")),
    )
    .await?;
    sent += send_batch(
        &sender,
        &factory,
        &queue,
        &format!("Message to B from {}", origin),
        1..=B_MESSAGES,
        Some(&service("B")),
    )
    .await?;

    let completed = log.wait_for(sent, timeout).await;
    log.drain();
    Ok(ScenarioReport {
        name: "two_dc_network",
        sent,
        expected: sent,
        completed,
        endpoints: endpoints(clients),
        observations: log.observations().to_vec(),
    })
}
