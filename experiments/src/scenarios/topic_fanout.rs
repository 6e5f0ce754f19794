use internals::Result;

use super::{
    consumer_label, endpoints, finish, open_clients, send_batch, settle, start_all, ConsumerPlan,
    ObservingClient, ScenarioReport,
};
use crate::config::ExperimentConfig;
use crate::observer::DeliveryLog;
use crate::sender::MessageSender;

/// One topic subscriber per client profile; each must see every event.
pub async fn topic_fanout(config: &ExperimentConfig) -> Result<ScenarioReport> {
    let topic = config.events_topic();
    let mut plans = Vec::with_capacity(config.profiles.len());
    for profile in 0..config.profiles.len() {
        let label = consumer_label(config, "Subscriber", profile)?;
        plans.push(ConsumerPlan::new(label, profile, topic.clone()));
    }

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
    let sent = send_batch(
        &sender,
        &factory,
        &config.events_topic(),
        &format!("Event from {}", origin),
        1..=config.messages_per_scenario,
        None,
    )
    .await?;

    let expected = sent * clients.len();
    let completed = log.wait_for(expected, config.timings.delivery_timeout()).await;
    log.drain();
    Ok(ScenarioReport {
        name: "topic_fanout",
        sent,
        expected,
        completed,
        endpoints: endpoints(clients),
        observations: log.observations().to_vec(),
    })
}
