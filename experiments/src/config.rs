use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use internals::{Destination, ProbeError, Result};
use serde::{Deserialize, Serialize};
use stomp::{ConnectionFactory, Credentials, Endpoint, FailoverUrl};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub brokers: Vec<BrokerConfig>,
    pub profiles: Vec<ClientProfile>,
    pub credentials: Option<CredentialsConfig>,
    pub destinations: DestinationsConfig,
    pub message: MessageConfig,
    pub timings: TimingsConfig,
    pub messages_per_scenario: usize,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub name: String,
    pub address: String,
}

/// One client's view of the broker network: the failover order of broker
/// names and the brokers it prefers while they are reachable.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub name: String,
    pub brokers: Vec<String>,
    #[serde(default)]
    pub priority: Vec<String>,
    #[serde(default)]
    pub randomize: bool,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub login: String,
    pub passcode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationsConfig {
    pub request_queue: String,
    pub events_topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    pub payload_bytes: usize,
    pub time_to_live_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingsConfig {
    /// Pause between subscribing and producing, so demand can propagate
    /// through the broker network
    pub network_settle_ms: u64,
    /// Upper bound on waiting for the expected deliveries
    pub delivery_timeout_ms: u64,
    pub slow_consumer_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound on broker confirmation of subscribe, commit and disconnect
    pub receipt_timeout_ms: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let broker = |name: &str, port: u16| BrokerConfig {
            name: name.to_string(),
            address: format!("tcp://localhost:{}", port),
        };
        let profile = |order: [&str; 4]| ClientProfile {
            name: order[0].to_string(),
            brokers: order.iter().map(|name| name.to_string()).collect(),
            priority: order[..2].iter().map(|name| name.to_string()).collect(),
            randomize: false,
        };

        ExperimentConfig {
            brokers: vec![
                broker("dc1-amq01", 61616),
                broker("dc1-amq02", 61617),
                broker("dc2-amq03", 61618),
                broker("dc2-amq04", 61619),
            ],
            profiles: vec![
                profile(["dc1-amq01", "dc1-amq02", "dc2-amq03", "dc2-amq04"]),
                profile(["dc1-amq02", "dc1-amq01", "dc2-amq04", "dc2-amq03"]),
                profile(["dc2-amq03", "dc2-amq04", "dc1-amq01", "dc1-amq02"]),
                profile(["dc2-amq04", "dc2-amq03", "dc1-amq02", "dc1-amq01"]),
            ],
            credentials: None,
            destinations: DestinationsConfig::default(),
            message: MessageConfig::default(),
            timings: TimingsConfig::default(),
            messages_per_scenario: 10,
        }
    }
}

impl Default for DestinationsConfig {
    fn default() -> Self {
        DestinationsConfig {
            request_queue: "REQUEST".to_string(),
            events_topic: "EVENTS".to_string(),
        }
    }
}

impl Default for MessageConfig {
    fn default() -> Self {
        MessageConfig {
            payload_bytes: 10_000,
            time_to_live_ms: 30_000,
        }
    }
}

impl Default for TimingsConfig {
    fn default() -> Self {
        TimingsConfig {
            network_settle_ms: 1_000,
            delivery_timeout_ms: 30_000,
            slow_consumer_delay_ms: 2_000,
            connect_timeout_ms: 5_000,
            receipt_timeout_ms: 10_000,
        }
    }
}

impl TimingsConfig {
    pub fn network_settle(&self) -> Duration {
        Duration::from_millis(self.network_settle_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn slow_consumer_delay(&self) -> Duration {
        Duration::from_millis(self.slow_consumer_delay_ms)
    }
}

impl ExperimentConfig {
    pub fn request_queue(&self) -> Destination {
        Destination::queue(self.destinations.request_queue.clone())
    }

    pub fn events_topic(&self) -> Destination {
        Destination::topic(self.destinations.events_topic.clone())
    }

    pub fn broker(&self, name: &str) -> Option<&BrokerConfig> {
        self.brokers.iter().find(|broker| broker.name == name)
    }

    /// Name of the configured broker listening on `endpoint`, or the
    /// endpoint itself when it is not part of the configuration.
    pub fn broker_name(&self, endpoint: &Endpoint) -> String {
        self.brokers
            .iter()
            .find(|broker| broker.address.parse::<Endpoint>().ok().as_ref() == Some(endpoint))
            .map(|broker| broker.name.clone())
            .unwrap_or_else(|| endpoint.to_string())
    }

    pub fn profile(&self, index: usize) -> Result<&ClientProfile> {
        self.profiles.get(index).ok_or_else(|| {
            ProbeError::Config(format!(
                "client profile #{} requested but only {} configured",
                index + 1,
                self.profiles.len()
            ))
        })
    }

    /// Renders the provider URL of a profile, e.g.
    /// `failover:(tcp://a:1,tcp://b:2)?randomize=false&priorityBackup=true&priorityURIs=tcp://a:1`.
    pub fn provider_url(&self, profile: &ClientProfile) -> Result<String> {
        let addresses = |names: &[String]| -> Result<Vec<String>> {
            names
                .iter()
                .map(|name| {
                    self.broker(name)
                        .map(|broker| broker.address.clone())
                        .ok_or_else(|| {
                            ProbeError::Config(format!(
                                "profile '{}' references unknown broker '{}'",
                                profile.name, name
                            ))
                        })
                })
                .collect()
        };

        let mut url = format!(
            "failover:({})?randomize={}",
            addresses(&profile.brokers)?.join(","),
            profile.randomize
        );
        if !profile.priority.is_empty() {
            url.push_str("&priorityBackup=true&priorityURIs=");
            url.push_str(&addresses(&profile.priority)?.join(","));
        }
        Ok(url)
    }

    pub fn connection_factory(&self, profile_index: usize) -> Result<ConnectionFactory> {
        let profile = self.profile(profile_index)?;
        let url: FailoverUrl = self.provider_url(profile)?.parse()?;
        let credentials = self.credentials.as_ref().map(|c| Credentials {
            login: c.login.clone(),
            passcode: c.passcode.clone(),
        });
        Ok(ConnectionFactory::new(url)
            .with_credentials(credentials)
            .with_connect_timeout(Duration::from_millis(self.timings.connect_timeout_ms))
            .with_receipt_timeout(Duration::from_millis(self.timings.receipt_timeout_ms)))
    }

    /// Name of the broker a profile expects to be attached to.
    pub fn primary_broker(&self, profile: &ClientProfile) -> Option<String> {
        profile
            .priority
            .first()
            .or_else(|| profile.brokers.first())
            .cloned()
    }

    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(ProbeError::Config("no brokers configured".to_string()));
        }
        let mut names = HashSet::new();
        for broker in &self.brokers {
            if !names.insert(broker.name.as_str()) {
                return Err(ProbeError::Config(format!(
                    "broker '{}' is defined twice",
                    broker.name
                )));
            }
            broker.address.parse::<Endpoint>()?;
        }
        if self.profiles.is_empty() {
            return Err(ProbeError::Config("no client profiles configured".to_string()));
        }
        for profile in &self.profiles {
            if profile.brokers.is_empty() {
                return Err(ProbeError::Config(format!(
                    "profile '{}' lists no brokers",
                    profile.name
                )));
            }
            if let Some(name) = profile.priority.iter().find(|p| !profile.brokers.contains(p)) {
                return Err(ProbeError::Config(format!(
                    "priority broker '{}' of profile '{}' is not in its broker list",
                    name, profile.name
                )));
            }
            self.provider_url(profile)?;
        }
        self.request_queue().to_string().parse::<Destination>()?;
        self.events_topic().to_string().parse::<Destination>()?;
        Ok(())
    }
}

fn validate_path(config_file_path: &Path) -> Result<()> {
    if !config_file_path.exists() {
        return Err(ProbeError::Config(format!(
            "config file {} does not exist",
            config_file_path.display()
        )));
    }
    Ok(())
}

/// Reads a JSON experiment configuration; absent fields keep their defaults.
pub fn load(config_file_path: &Path) -> Result<ExperimentConfig> {
    validate_path(config_file_path)?;
    let file = File::open(config_file_path)?;
    let reader = BufReader::new(file);
    let config: ExperimentConfig = serde_json::from_reader(reader)
        .map_err(|e| ProbeError::Config(format!("{}: {}", config_file_path.display(), e)))?;
    config.validate()?;
    Ok(config)
}
