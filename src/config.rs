use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AgentError;

/// One TSD endpoint in the configured pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TsdHost {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory tree scanned for collector executables. Each numeric
    /// subdirectory names the spawn interval of the files inside it.
    pub collectors_root: PathBuf,
    /// Ordered pool of TSD endpoints; the sender shuffles it once at
    /// startup and rotates through it.
    pub tsd_hosts: Vec<TsdHost>,
    /// Send over the HTTP batch API instead of the line protocol.
    pub http: bool,
    pub http_api_path: String,
    /// Injected as `host=<tag>` into outbound samples lacking one.
    pub host_tag: Option<String>,
    /// Concatenated to every metric name at read time.
    pub namespace_prefix: Option<String>,
    /// Max seconds an unchanged series is suppressed before a heartbeat
    /// sample goes out.
    pub dedup_interval: u64,
    /// Blacklist duration after a transport failure, seconds.
    pub reconnect_interval: u64,
    pub max_queue_depth: usize,
    /// Samples per delivery attempt.
    pub max_batch: usize,
    /// Seconds between manager ticks.
    pub manager_tick: u64,
    /// Optional `host:port` for the read-only status endpoint.
    pub status_listen: Option<String>,
    /// Extra environment handed to collector children on top of a clean
    /// environment plus PATH.
    pub collector_env: HashMap<String, String>,
    /// Upper bound on the whole shutdown sequence, seconds.
    pub shutdown_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            collectors_root: PathBuf::from("collectors"),
            tsd_hosts: Vec::new(),
            http: false,
            http_api_path: "api/put".to_string(),
            host_tag: None,
            namespace_prefix: None,
            dedup_interval: 600,
            reconnect_interval: 300,
            max_queue_depth: 100_000,
            max_batch: 1000,
            manager_tick: 15,
            status_listen: None,
            collector_env: HashMap::new(),
            shutdown_timeout: 30,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, AgentError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| AgentError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Reject configurations the pipeline cannot run with. Called once
    /// at startup; failures are fatal.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.tsd_hosts.is_empty() {
            return Err(AgentError::Config(
                "tsd_hosts must list at least one endpoint".to_string(),
            ));
        }
        for tsd in &self.tsd_hosts {
            if tsd.host.is_empty() || tsd.port == 0 {
                return Err(AgentError::Config(format!(
                    "invalid tsd host {:?}:{}",
                    tsd.host, tsd.port
                )));
            }
        }
        if !self.collectors_root.is_dir() {
            return Err(AgentError::Config(format!(
                "collectors_root {} is not a directory",
                self.collectors_root.display()
            )));
        }
        // The prefix is opaque: non-empty is the only requirement.
        if let Some(prefix) = &self.namespace_prefix
            && prefix.is_empty()
        {
            return Err(AgentError::Config(
                "namespace_prefix must be non-empty".to_string(),
            ));
        }
        // A tag value with whitespace would split into extra tokens on
        // the line protocol, corrupting every outbound sample.
        if let Some(tag) = &self.host_tag
            && (tag.is_empty() || tag.chars().any(char::is_whitespace))
        {
            return Err(AgentError::Config(
                "host_tag must be non-empty and whitespace-free".to_string(),
            ));
        }
        if let Some(addr) = &self.status_listen {
            addr.parse::<std::net::SocketAddr>().map_err(|e| {
                AgentError::Config(format!("status_listen {addr} is not host:port: {e}"))
            })?;
        }
        if self.max_queue_depth == 0 {
            return Err(AgentError::Config("max_queue_depth must be positive".to_string()));
        }
        if self.max_batch == 0 {
            return Err(AgentError::Config("max_batch must be positive".to_string()));
        }
        if self.manager_tick == 0 {
            return Err(AgentError::Config("manager_tick must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.dedup_interval, 600);
        assert_eq!(cfg.reconnect_interval, 300);
        assert_eq!(cfg.max_queue_depth, 100_000);
        assert_eq!(cfg.manager_tick, 15);
        assert_eq!(cfg.http_api_path, "api/put");
        assert_eq!(cfg.shutdown_timeout, 30);
        assert!(!cfg.http);
    }

    #[test]
    fn parses_full_toml() {
        let cfg: Config = toml::from_str(
            r#"
            collectors_root = "/etc/stratus/collectors"
            http = true
            http_api_path = "api/put"
            host_tag = "web01"
            namespace_prefix = "dc1."
            dedup_interval = 300
            status_listen = "127.0.0.1:13280"

            [[tsd_hosts]]
            host = "tsd-a"
            port = 4242

            [[tsd_hosts]]
            host = "tsd-b"
            port = 4242

            [collector_env]
            TSD_ENV = "prod"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.tsd_hosts.len(), 2);
        assert_eq!(cfg.tsd_hosts[0].host, "tsd-a");
        assert!(cfg.http);
        assert_eq!(cfg.namespace_prefix.as_deref(), Some("dc1."));
        assert_eq!(cfg.collector_env["TSD_ENV"], "prod");
        // Untouched fields keep their defaults.
        assert_eq!(cfg.max_queue_depth, 100_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = toml::from_str::<Config>("no_such_option = 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn validate_requires_endpoints() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_only_non_empty_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let base = Config {
            collectors_root: dir.path().to_path_buf(),
            tsd_hosts: vec![TsdHost {
                host: "localhost".to_string(),
                port: 4242,
            }],
            ..Config::default()
        };

        let empty = Config {
            namespace_prefix: Some(String::new()),
            ..base.clone()
        };
        assert!(empty.validate().is_err());

        // The prefix is opaque beyond that; nothing else is rejected.
        let odd = Config {
            namespace_prefix: Some("my prefix.".to_string()),
            ..base
        };
        odd.validate().unwrap();
    }

    #[test]
    fn validate_rejects_whitespace_host_tag() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            collectors_root: dir.path().to_path_buf(),
            tsd_hosts: vec![TsdHost {
                host: "localhost".to_string(),
                port: 4242,
            }],
            host_tag: Some("web 01".to_string()),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            collectors_root: dir.path().to_path_buf(),
            tsd_hosts: vec![TsdHost {
                host: "localhost".to_string(),
                port: 4242,
            }],
            ..Config::default()
        };
        cfg.validate().unwrap();
    }
}
