use internals::Result;

use super::{
    consumer_label, endpoints, finish, open_clients, send_batch, service, settle, start_all,
    ConsumerPlan, ObservingClient, ScenarioReport,
};
use crate::config::ExperimentConfig;
use crate::observer::DeliveryLog;
use crate::sender::MessageSender;

/// Two consumers of the request queue filter on the `service` header; each
/// must only see its own service's messages.
pub async fn selector(config: &ExperimentConfig) -> Result<ScenarioReport> {
    let queue = config.request_queue();
    let b_profile = if config.profiles.len() > 1 { 1 } else { 0 };
    let plans = [
        ConsumerPlan::new(consumer_label(config, "Consumer A", 0)?, 0, queue.clone())
            .selector("service = 'A'"),
        ConsumerPlan::new(consumer_label(config, "Consumer B", b_profile)?, b_profile, queue)
            .selector("service = 'B'"),
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
    settle(config).await;

    let origin = &config.profile(0)?.name;
    let sender = MessageSender::from_config(&config.message);
    let factory = config.connection_factory(0)?;
    let queue = config.request_queue();
    let count = config.messages_per_scenario;

    let mut sent = 0;
    for name in ["A", "B"] {
        sent += send_batch(
            &sender,
            &factory,
            &queue,
            &format!("Message to {} from {}", name, origin),
            1..=count,
            Some(&service(name)),
        )
        .await?;
    }

    let completed = log.wait_for(sent, config.timings.delivery_timeout()).await;
    log.drain();
    Ok(ScenarioReport {
        name: "selector",
        sent,
        expected: sent,
        completed,
        endpoints: endpoints(clients),
        observations: log.observations().to_vec(),
    })
}
