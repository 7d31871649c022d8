//! Turning a destination argument into a broker destination.
//!
//! Names are first looked up in a directory (the ActiveMQ JNDI naming scheme:
//! `dynamicQueues/<name>`, `dynamicTopics/<name>` and entries from a
//! properties file). When the lookup fails for any reason the name is parsed
//! as a `queue://` or `topic://` literal.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stomp_client::Destination;
use thiserror::Error;
use tracing::debug;

use crate::{BrokerTarget, HarnessError};

/// Names a properties file with `queue.<name> = <physical>` and
/// `topic.<name> = <physical>` entries.
pub const DIRECTORY_PROPERTIES_VAR: &str = "HARNESS_JNDI_PROPERTIES";

const QUEUE_PREFIX: &str = "queue://";
const TOPIC_PREFIX: &str = "topic://";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no directory entry named '{0}'")]
    NotFound(String),

    #[error("failed to read directory file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub trait DirectoryLookup: Send + Sync {
    fn lookup(&self, provider_url: &str, name: &str) -> Result<Destination, LookupError>;
}

#[derive(Debug, Clone, Default)]
pub struct PropertiesDirectory {
    path: Option<PathBuf>,
}

impl PropertiesDirectory {
    pub fn from_env() -> Self {
        PropertiesDirectory {
            path: env::var_os(DIRECTORY_PROPERTIES_VAR).map(PathBuf::from),
        }
    }

    pub fn with_file(path: impl AsRef<Path>) -> Self {
        PropertiesDirectory {
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    fn load(path: &Path) -> Result<HashMap<String, Destination>, LookupError> {
        let contents = fs::read_to_string(path).map_err(|source| LookupError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let mut entries = HashMap::new();
        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some(split) = line.find(['=', ':']) else {
                continue;
            };
            let key = line[..split].trim();
            let physical = line[split + 1..].trim().to_string();

            if let Some(name) = key.strip_prefix("queue.") {
                entries.insert(name.to_string(), Destination::Queue(physical));
            } else if let Some(name) = key.strip_prefix("topic.") {
                entries.insert(name.to_string(), Destination::Topic(physical));
            }
        }
        Ok(entries)
    }
}

impl DirectoryLookup for PropertiesDirectory {
    fn lookup(&self, _provider_url: &str, name: &str) -> Result<Destination, LookupError> {
        if let Some(queue) = name.strip_prefix("dynamicQueues/") {
            return Ok(Destination::Queue(queue.to_string()));
        }
        if let Some(topic) = name.strip_prefix("dynamicTopics/") {
            return Ok(Destination::Topic(topic.to_string()));
        }

        let path = self
            .path
            .as_deref()
            .ok_or_else(|| LookupError::NotFound(name.to_string()))?;
        Self::load(path)?
            .remove(name)
            .ok_or_else(|| LookupError::NotFound(name.to_string()))
    }
}

/// Parse `queue://name` or `topic://name`. The prefix is case-insensitive.
pub fn parse_literal(name: &str) -> Result<Destination, HarnessError> {
    let not_found = || HarnessError::Resolution(format!("{name} not found"));

    let prefix = name.get(..QUEUE_PREFIX.len()).ok_or_else(not_found)?;
    let simple = &name[QUEUE_PREFIX.len()..];

    let destination = if prefix.eq_ignore_ascii_case(QUEUE_PREFIX) {
        Destination::Queue(simple.to_string())
    } else if prefix.eq_ignore_ascii_case(TOPIC_PREFIX) {
        Destination::Topic(simple.to_string())
    } else {
        return Err(not_found());
    };

    if simple.is_empty() {
        return Err(HarnessError::Resolution(format!(
            "{name} does not name a destination"
        )));
    }
    Ok(destination)
}

#[derive(Clone)]
pub struct DestinationResolver {
    directory: Arc<dyn DirectoryLookup>,
}

impl Default for DestinationResolver {
    fn default() -> Self {
        DestinationResolver::new(PropertiesDirectory::from_env())
    }
}

impl DestinationResolver {
    pub fn new(directory: impl DirectoryLookup + 'static) -> Self {
        DestinationResolver {
            directory: Arc::new(directory),
        }
    }

    pub fn resolve(&self, uri: &str, name: &str) -> Result<Destination, HarnessError> {
        match self.directory.lookup(uri, name) {
            Ok(destination) => {
                debug!("Resolved {name} to {destination} through the directory");
                return Ok(destination);
            }
            Err(e) => debug!("Directory lookup failed, parsing {name} as a literal: {e}"),
        }
        parse_literal(name)
    }

    pub fn resolve_target(&self, uri: &str, name: &str) -> Result<BrokerTarget, HarnessError> {
        let destination = self.resolve(uri, name)?;
        Ok(BrokerTarget {
            uri: uri.to_string(),
            destination,
        })
    }
}
