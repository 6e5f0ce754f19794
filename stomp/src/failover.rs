//! Provider URLs: a single `tcp://host:port` endpoint or a failover list
//! such as
//! `failover:(tcp://a:61616,tcp://b:61617)?randomize=false&priorityBackup=true&priorityURIs=tcp://a:61616`.

use std::fmt;
use std::str::FromStr;

use internals::{ProbeError, Result};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::debug;

const FAILOVER_SCHEME: &str = "failover:";
const ENDPOINT_SCHEMES: [&str; 3] = ["tcp://", "stomp://", "nio://"];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ProbeError::InvalidUrl {
            url: s.to_string(),
            reason: reason.to_string(),
        };

        let authority = ENDPOINT_SCHEMES
            .iter()
            .find_map(|scheme| s.strip_prefix(scheme))
            .ok_or_else(|| invalid("expected a tcp:// endpoint"))?;
        // transport options (`?wireFormat...`) do not affect STOMP
        let authority = authority.split(['?', '/']).next().unwrap_or_default();
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        Ok(Endpoint::new(host, port))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FailoverUrl {
    raw: String,
    pub endpoints: Vec<Endpoint>,
    pub randomize: bool,
    pub priority_backup: bool,
    pub priority_uris: Vec<Endpoint>,
}

impl FailoverUrl {
    pub fn single(endpoint: Endpoint) -> Self {
        FailoverUrl {
            raw: endpoint.to_string(),
            endpoints: vec![endpoint],
            randomize: false,
            priority_backup: false,
            priority_uris: Vec::new(),
        }
    }

    /// Order in which endpoints are tried when connecting: priority
    /// endpoints first (only with `priorityBackup`), the rest after them,
    /// shuffled when `randomize` is set.
    pub fn connect_order(&self) -> Vec<Endpoint> {
        let mut rest = self.endpoints.clone();
        if self.randomize {
            rest.shuffle(&mut thread_rng());
        }
        if !self.priority_backup {
            return rest;
        }

        let priority: Vec<Endpoint> = if self.priority_uris.is_empty() {
            self.endpoints.iter().take(1).cloned().collect()
        } else {
            self.priority_uris.clone()
        };
        rest.retain(|endpoint| !priority.contains(endpoint));

        let mut order: Vec<Endpoint> = priority
            .into_iter()
            .filter(|endpoint| self.endpoints.contains(endpoint))
            .collect();
        order.extend(rest);
        order
    }
}

impl fmt::Display for FailoverUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for FailoverUrl {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let Some(rest) = s.strip_prefix(FAILOVER_SCHEME) else {
            let mut url = FailoverUrl::single(s.parse()?);
            url.raw = s.to_string();
            return Ok(url);
        };

        let invalid = |reason: &str| ProbeError::InvalidUrl {
            url: s.to_string(),
            reason: reason.to_string(),
        };

        let (list, query) = match rest.strip_prefix('(') {
            Some(inner) => {
                let (list, tail) = inner
                    .split_once(')')
                    .ok_or_else(|| invalid("unbalanced parentheses"))?;
                let query = match tail {
                    "" => None,
                    tail => Some(
                        tail.strip_prefix('?')
                            .ok_or_else(|| invalid("expected '?' after endpoint list"))?,
                    ),
                };
                (list, query)
            }
            None => match rest.split_once('?') {
                Some((list, query)) => (list, Some(query)),
                None => (rest, None),
            },
        };

        let endpoints = parse_endpoint_list(list)?;
        if endpoints.is_empty() {
            return Err(invalid("no endpoints"));
        }

        let mut url = FailoverUrl {
            raw: s.to_string(),
            endpoints,
            randomize: true,
            priority_backup: false,
            priority_uris: Vec::new(),
        };

        for option in query.unwrap_or_default().split('&').filter(|o| !o.is_empty()) {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| invalid("option without value"))?;
            match key {
                "randomize" => url.randomize = parse_flag(value).ok_or_else(|| invalid("randomize"))?,
                "priorityBackup" => {
                    url.priority_backup =
                        parse_flag(value).ok_or_else(|| invalid("priorityBackup"))?
                }
                "priorityURIs" => url.priority_uris = parse_endpoint_list(value)?,
                other => debug!(option = %other, "ignoring failover option"),
            }
        }

        Ok(url)
    }
}

fn parse_endpoint_list(list: &str) -> Result<Vec<Endpoint>> {
    list.split(',')
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::parse)
        .collect()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
