use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::errors::ProbeError;

/// String properties attached to a message, e.g. `service = A`.
pub type Headers = BTreeMap<String, String>;

const QUEUE_PREFIX: &str = "/queue/";
const TOPIC_PREFIX: &str = "/topic/";
const DYNAMIC_QUEUE_PREFIX: &str = "dynamicQueues/";
const DYNAMIC_TOPIC_PREFIX: &str = "dynamicTopics/";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Destination::Topic(name.into())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "{}{}", QUEUE_PREFIX, name),
            Destination::Topic(name) => write!(f, "{}{}", TOPIC_PREFIX, name),
        }
    }
}

/// Accepts the wire form (`/queue/REQUEST`) as well as the naming-service
/// form (`dynamicQueues/REQUEST`).
impl FromStr for Destination {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = if let Some(name) = s.strip_prefix(QUEUE_PREFIX) {
            (false, name)
        } else if let Some(name) = s.strip_prefix(DYNAMIC_QUEUE_PREFIX) {
            (false, name)
        } else if let Some(name) = s.strip_prefix(TOPIC_PREFIX) {
            (true, name)
        } else if let Some(name) = s.strip_prefix(DYNAMIC_TOPIC_PREFIX) {
            (true, name)
        } else {
            return Err(ProbeError::Config(format!(
                "destination '{}' must start with /queue/ or /topic/",
                s
            )));
        };

        if name.is_empty() {
            return Err(ProbeError::Config(format!(
                "destination '{}' has an empty name",
                s
            )));
        }

        Ok(if kind {
            Destination::topic(name)
        } else {
            Destination::queue(name)
        })
    }
}

/// A transient message as produced by the experiments: an opaque body,
/// a human-readable correlation label and string properties.
#[derive(Clone, PartialEq, Default, Debug)]
pub struct Message {
    pub correlation_id: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Message {
    pub fn new(correlation_id: impl Into<String>, body: Bytes) -> Self {
        Message {
            correlation_id: correlation_id.into(),
            headers: Headers::new(),
            body,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: &Headers) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// A message as delivered to a consumer.
#[derive(Clone, PartialEq, Debug)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub destination: String,
    pub subscription: String,
    /// Value of the `ack` header, present for client-acknowledged subscriptions
    pub ack_id: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
}

impl ReceivedMessage {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}
