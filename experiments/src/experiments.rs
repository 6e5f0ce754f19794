//! Delivery experiments against a network of STOMP brokers spread over two
//! data centers: priority failover, selectors, slow consumers, topic fan-out
//! and store-and-forward between data centers.

pub mod config;
pub mod observer;
pub mod runner;
pub mod scenarios;
pub mod sender;

pub use config::ExperimentConfig;
pub use observer::{DeliveryLog, Observation, ObservingListener};
pub use runner::{run, run_all, Experiment};
pub use scenarios::ScenarioReport;
pub use sender::MessageSender;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod tests_utils;
