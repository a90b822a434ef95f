//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the coordinator and its message pump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Pending durability work (unflushed log entries plus requests held
    /// for the flush) that forces a flush
    pub batch_size: usize,

    /// How long a participant may take to reply before it is failed.
    /// `None` waits forever.
    pub reply_timeout: Option<Duration>,

    /// How long the pump waits for input while deferred work is outstanding
    pub poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            reply_timeout: None,
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Entry of the resource property catalogue: what a resource key means
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProperty {
    pub key: String,
    /// Executable of the resource proxy server
    pub server: String,
    /// Name of the XA switch the proxy links
    pub xa_switch: String,
}

/// A configured resource manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    /// Must name an entry of the resource property catalogue
    pub key: String,
    #[serde(default)]
    pub openinfo: String,
    #[serde(default)]
    pub closeinfo: String,
    /// Number of proxy instances to run
    #[serde(default = "default_instances")]
    pub instances: usize,
}

fn default_instances() -> usize {
    1
}

impl ProxyConfig {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            openinfo: String::new(),
            closeinfo: String::new(),
            instances: default_instances(),
        }
    }

    pub fn with_openinfo(mut self, openinfo: impl Into<String>) -> Self {
        self.openinfo = openinfo.into();
        self
    }

    pub fn with_closeinfo(mut self, closeinfo: impl Into<String>) -> Self {
        self.closeinfo = closeinfo.into();
        self
    }

    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.reply_timeout, None);

        let config = config
            .with_batch_size(0)
            .with_reply_timeout(Duration::from_secs(5));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.reply_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: CoordinatorConfig = serde_json::from_str(r#"{ "batch_size": 10 }"#).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.poll_interval, Duration::from_millis(10));

        let proxy: ProxyConfig =
            serde_json::from_str(r#"{ "name": "db", "key": "pq", "openinfo": "dbname=x" }"#)
                .unwrap();
        assert_eq!(proxy, ProxyConfig::new("db", "pq").with_openinfo("dbname=x"));
    }
}
