//! Store descriptors and their canonical form

use crate::client::CredentialRef;
use eyre::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Backoff before the single retry on an unreachable host
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    #[serde(alias = "es")]
    Elasticsearch,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Elasticsearch => "elasticsearch",
        }
    }
}

/// A store as written in a job file
///
/// Either a bare path to a SQLite file or a structured descriptor:
///
/// ```yaml
/// store:
///   backend: elasticsearch
///   name: prices
///   host: http://localhost:9200
///   credential:
///     type: apikey
///     apikey_env: ES_APIKEY
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreSpec {
    Path(String),
    Descriptor(StoreDescriptor),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub backend: BackendKind,
    pub name: String,
    #[serde(default)]
    pub host: Option<Url>,
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    #[serde(default)]
    pub retry_backoff_secs: Option<u64>,
}

impl StoreSpec {
    /// Turn either form into the one canonical [`StoreConfig`]
    pub fn normalise(self) -> Result<StoreConfig> {
        match self {
            Self::Path(path) => {
                if path.trim().is_empty() {
                    bail!("Store path is empty");
                }
                Ok(StoreConfig::sqlite(path))
            }
            Self::Descriptor(d) => {
                if d.name.trim().is_empty() {
                    bail!("Store name is empty");
                }
                if d.backend == BackendKind::Elasticsearch && d.host.is_none() {
                    bail!("Elasticsearch store '{}' needs a host", d.name);
                }
                Ok(StoreConfig {
                    backend: d.backend,
                    name: d.name,
                    host: d.host,
                    credential: d.credential,
                    retry_backoff: d
                        .retry_backoff_secs
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_RETRY_BACKOFF),
                })
            }
        }
    }
}

/// Canonical store configuration, resolved once at the entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// SQLite file path, or the index prefix for a document store
    pub name: String,
    pub host: Option<Url>,
    pub credential: Option<CredentialRef>,
    pub retry_backoff: Duration,
}

impl StoreConfig {
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Sqlite,
            name: path.into(),
            host: None,
            credential: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// True when this identity already carries the test suffix
    pub fn is_test(&self) -> bool {
        match self.backend {
            BackendKind::Sqlite => {
                self.name.ends_with("-test.sqlite") || self.name.ends_with("-test")
            }
            BackendKind::Elasticsearch => self.name.ends_with("_test"),
        }
    }

    /// The same store renamed for test mode
    ///
    /// `x.sqlite` becomes `x-test.sqlite`, an index prefix `name` becomes
    /// `name_test`. Already-suffixed identities are returned unchanged.
    pub fn for_test(&self) -> Self {
        if self.is_test() {
            return self.clone();
        }
        let name = match self.backend {
            BackendKind::Sqlite => match self.name.strip_suffix(".sqlite") {
                Some(stem) => format!("{}-test.sqlite", stem),
                None => format!("{}-test", self.name),
            },
            BackendKind::Elasticsearch => format!("{}_test", self.name),
        };
        Self {
            name,
            ..self.clone()
        }
    }
}

impl fmt::Display for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}:{} ({})", self.backend.as_str(), self.name, host),
            None => write!(f, "{}:{}", self.backend.as_str(), self.name),
        }
    }
}
