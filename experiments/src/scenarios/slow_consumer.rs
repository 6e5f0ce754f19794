use internals::Result;

use super::{
    consumer_label, endpoints, finish, open_clients, send_batch, start_all, ConsumerPlan,
    ObservingClient, ScenarioReport,
};
use crate::config::ExperimentConfig;
use crate::observer::DeliveryLog;
use crate::sender::MessageSender;

const PREFETCH: u32 = 1;

/// Two competing client-ack consumers with a prefetch of one; the slow one
/// holds every message for `slow_consumer_delay_ms`, so the fast one ends up
/// with the larger share.
pub async fn slow_consumer(config: &ExperimentConfig) -> Result<ScenarioReport> {
    let queue = config.request_queue();
    let plans = [
        ConsumerPlan::new(consumer_label(config, "Fast consumer", 0)?, 0, queue.clone())
            .client_ack(PREFETCH),
        ConsumerPlan::new(consumer_label(config, "Slow consumer", 0)?, 0, queue)
            .client_ack(PREFETCH)
            .delay(config.timings.slow_consumer_delay()),
    ];

    let mut log = DeliveryLog::new();
    let clients = open_clients(config, &plans, &log).await?;
    let outcome = drive(config, &clients, &mut log).await;
    finish(outcome, clients).await
}

async fn drive(
    config: &ExperimentConfig,
    clients: &[ObservingClient],
    log: &mut DeliveryLog,
) -> Result<ScenarioReport> {
    start_all(clients);

    let origin = &config.profile(0)?.name;
    let sender = MessageSender::from_config(&config.message);
    let factory = config.connection_factory(0)?;
    let sent = send_batch(
        &sender,
        &factory,
        &config.request_queue(),
        &format!("Work item from {}", origin),
        1..=config.messages_per_scenario,
        None,
    )
    .await?;

    let completed = log.wait_for(sent, config.timings.delivery_timeout()).await;
    log.drain();
    Ok(ScenarioReport {
        name: "slow_consumer",
        sent,
        expected: sent,
        completed,
        endpoints: endpoints(clients),
        observations: log.observations().to_vec(),
    })
}
