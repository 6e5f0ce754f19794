use internals::Result;

use super::{
    consumer_label, endpoints, finish, open_clients, send_batch, start_all, ConsumerPlan,
    ObservingClient, ScenarioReport,
};
use crate::config::ExperimentConfig;
use crate::observer::DeliveryLog;
use crate::sender::MessageSender;

const PROFILE: usize = 0;

/// Producer and consumer share the primary's priority failover URL, so both
/// attach to the primary broker and every message is consumed there once.
pub async fn priority_failover(config: &ExperimentConfig) -> Result<ScenarioReport> {
    let label = consumer_label(config, "Consumer", PROFILE)?;
    let plans = [ConsumerPlan::new(label, PROFILE, config.request_queue())];

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

    let profile = config.profile(PROFILE)?;
    let sender = MessageSender::from_config(&config.message);
    let factory = config.connection_factory(PROFILE)?;
    let sent = send_batch(
        &sender,
        &factory,
        &config.request_queue(),
        &format!("Priority message from {}", profile.name),
        1..=config.messages_per_scenario,
        None,
    )
    .await?;

    let completed = log.wait_for(sent, config.timings.delivery_timeout()).await;
    log.drain();
    Ok(ScenarioReport {
        name: "priority_failover",
        sent,
        expected: sent,
        completed,
        endpoints: endpoints(clients),
        observations: log.observations().to_vec(),
    })
}
