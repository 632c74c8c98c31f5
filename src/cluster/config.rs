//! Static node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{ExportSpec, Role};
use crate::utils::FedError;

use serde::Deserialize;

/// Configuration parameters of one cluster node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Role of this node: "manager", "supervisor", "server", or "peer".
    pub role: String,

    /// Site (cluster group) name announced at login.
    pub site: String,

    /// Host name this node is reachable at by its peers.
    pub host_name: String,

    /// Port to accept subordinate logins on; 0 disables listening.
    pub listen_port: u16,

    /// Port clients reach this node's data service on.
    pub data_port: u16,

    /// Upstream managers to subscribe to, each as "host:port".
    pub managers: Vec<String>,

    /// Alternates handed out when the server slot table is full.
    pub redirect_alternates: Vec<String>,

    /// Maximum number of attached subordinates (at most 64).
    pub max_servers: u8,

    /// Maximum number of concurrently attached upstream managers.
    pub max_managers: u8,

    /// Interval between pings to a subordinate.
    pub ping_interval_ms: u64,

    /// Subordinate declared dead after this many unanswered pings.
    pub max_missed_pings: u8,

    /// Timeout for connecting plus the login exchange.
    pub login_timeout_ms: u64,

    /// Fan-out query deadline; also how long deferred requests stay queued.
    pub query_delay_ms: u64,

    /// Retry-after hint given to clients of unresolved paths.
    pub poll_wait_secs: u32,

    /// Retry-after hint given while this node is suspended.
    pub suspend_wait_secs: u32,

    /// Period of the cache maintenance task.
    pub scrub_interval_ms: u64,

    /// Idle empty cache lines are evicted after this long.
    pub suspect_hold_ms: u64,

    /// Offline subordinate slots are reclaimed after this long.
    pub drop_delay_ms: u64,

    /// Base reconnect delay after being redirected.
    pub backoff_redirect_ms: u64,

    /// Base reconnect delay after a failed attempt.
    pub backoff_failure_ms: u64,

    /// Failures against the primary before logging in as "trying".
    pub max_primary_fails: u32,

    /// Largest accepted frame payload in bytes.
    pub max_payload: usize,

    /// Exported path prefixes, each as "/prefix" or "/prefix:rw".
    pub exports: Vec<String>,

    /// Local filesystem root; empty makes this node a pure cache layer.
    pub data_root: String,

    /// Hold off subscribing upward while this node is suspended.
    pub wait_for_resume: bool,

    /// Unix socket for local admin commands; empty disables it.
    pub admin_path: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            role: "manager".into(),
            site: "local".into(),
            host_name: "127.0.0.1".into(),
            listen_port: 3121,
            data_port: 1094,
            managers: vec![],
            redirect_alternates: vec![],
            max_servers: 64,
            max_managers: 8,
            ping_interval_ms: 60_000,
            max_missed_pings: 3,
            login_timeout_ms: 5_000,
            query_delay_ms: 5_000,
            poll_wait_secs: 5,
            suspend_wait_secs: 30,
            scrub_interval_ms: 60_000,
            suspect_hold_ms: 600_000,
            drop_delay_ms: 600_000,
            backoff_redirect_ms: 1_000,
            backoff_failure_ms: 15_000,
            max_primary_fails: 3,
            max_payload: 4096,
            exports: vec![],
            data_root: "".into(),
            wait_for_resume: false,
            admin_path: "".into(),
        }
    }
}

/// Splits a "host:port" endpoint string.
pub fn parse_endpoint(s: &str) -> Result<(String, u16), FedError> {
    let (host, port) = s.rsplit_once(':').ok_or_else(|| {
        FedError::msg(format!("endpoint '{}' lacks a port", s))
    })?;
    if host.is_empty() {
        return Err(FedError::msg(format!("endpoint '{}' lacks a host", s)));
    }
    Ok((host.to_string(), port.parse()?))
}

impl NodeConfig {
    /// Parses a TOML config string on top of the default values.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, FedError> {
        let config = parsed_config!(config_str => NodeConfig;
                                    role, site, host_name, listen_port,
                                    data_port, managers, redirect_alternates,
                                    max_servers, max_managers,
                                    ping_interval_ms, max_missed_pings,
                                    login_timeout_ms, query_delay_ms,
                                    poll_wait_secs, suspend_wait_secs,
                                    scrub_interval_ms, suspect_hold_ms,
                                    drop_delay_ms, backoff_redirect_ms,
                                    backoff_failure_ms, max_primary_fails,
                                    max_payload, exports, data_root,
                                    wait_for_resume, admin_path)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), FedError> {
        let role = self.role()?;
        if role == Role::Redirector {
            return logged_err!("redirector is not a cluster node role");
        }
        if self.max_servers == 0 || self.max_servers > 64 {
            return logged_err!(
                "invalid config.max_servers '{}'",
                self.max_servers
            );
        }
        if self.max_managers == 0 || self.max_managers > 64 {
            return logged_err!(
                "invalid config.max_managers '{}'",
                self.max_managers
            );
        }
        for (name, ms) in [
            ("ping_interval_ms", self.ping_interval_ms),
            ("login_timeout_ms", self.login_timeout_ms),
            ("query_delay_ms", self.query_delay_ms),
            ("scrub_interval_ms", self.scrub_interval_ms),
        ] {
            if ms == 0 {
                return logged_err!("invalid config.{} '{}'", name, ms);
            }
        }
        if self.max_missed_pings == 0 {
            return logged_err!("invalid config.max_missed_pings '0'");
        }
        if self.max_payload == 0 || self.max_payload > u16::MAX as usize {
            return logged_err!(
                "invalid config.max_payload '{}'",
                self.max_payload
            );
        }
        if role == Role::Manager && !self.managers.is_empty() {
            return logged_err!("a manager does not subscribe upward");
        }
        if role != Role::Manager && self.managers.is_empty() {
            return logged_err!("role {} needs config.managers", role);
        }
        self.manager_endpoints()?;
        self.alternate_endpoints()?;
        self.export_specs()?;
        Ok(())
    }

    /// Parsed role.
    pub fn role(&self) -> Result<Role, FedError> {
        self.role.parse()
    }

    /// Parsed upstream manager list.
    pub fn manager_endpoints(&self) -> Result<Vec<(String, u16)>, FedError> {
        self.managers.iter().map(|s| parse_endpoint(s)).collect()
    }

    /// Parsed redirect alternates list.
    pub fn alternate_endpoints(
        &self,
    ) -> Result<Vec<(String, u16)>, FedError> {
        self.redirect_alternates
            .iter()
            .map(|s| parse_endpoint(s))
            .collect()
    }

    /// Parsed export list.
    pub fn export_specs(&self) -> Result<Vec<ExportSpec>, FedError> {
        self.exports.iter().map(|s| s.parse()).collect()
    }

    /// Address to bind the login listener to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.listen_port))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn query_delay(&self) -> Duration {
        Duration::from_millis(self.query_delay_ms)
    }

    pub fn scrub_interval(&self) -> Duration {
        Duration::from_millis(self.scrub_interval_ms)
    }

    pub fn suspect_hold(&self) -> Duration {
        Duration::from_millis(self.suspect_hold_ms)
    }

    pub fn drop_delay(&self) -> Duration {
        Duration::from_millis(self.drop_delay_ms)
    }

    /// Is `(host, port)` this node's own login listener?
    pub fn is_self(&self, host: &str, port: u16) -> bool {
        port == self.listen_port
            && self.listen_port != 0
            && (host == self.host_name
                || host == "localhost"
                || host == "127.0.0.1"
                || host == "0.0.0.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() -> Result<(), FedError> {
        NodeConfig::default().validate()?;
        let config = NodeConfig::from_toml(None)?;
        assert_eq!(config.role()?, Role::Manager);
        Ok(())
    }

    #[test]
    fn parse_server_config() -> Result<(), FedError> {
        let config = NodeConfig::from_toml(Some(
            "role = 'server'\n\
             listen_port = 0\n\
             managers = ['mgr.example:3121', '10.0.0.2:3122']\n\
             exports = ['/data:rw', '/archive']\n\
             data_root = '/srv/data'",
        ))?;
        assert_eq!(config.role()?, Role::Server);
        assert_eq!(
            config.manager_endpoints()?,
            vec![
                ("mgr.example".to_string(), 3121),
                ("10.0.0.2".to_string(), 3122)
            ]
        );
        assert!(config.export_specs()?[0].rw);
        assert!(!config.is_self("127.0.0.1", 0));
        Ok(())
    }

    #[test]
    fn reject_bad_configs() {
        assert!(NodeConfig::from_toml(Some("role = 'server'")).is_err());
        assert!(NodeConfig::from_toml(Some("max_servers = 65")).is_err());
        assert!(NodeConfig::from_toml(Some("no_such_key = 1")).is_err());
        assert!(NodeConfig::from_toml(Some(
            "role = 'supervisor'\nmanagers = ['nohost']"
        ))
        .is_err());
        assert!(NodeConfig::from_toml(Some("exports = ['rel']")).is_err());
    }

    #[test]
    fn self_detection() {
        let config = NodeConfig::default();
        assert!(config.is_self("localhost", 3121));
        assert!(config.is_self("127.0.0.1", 3121));
        assert!(!config.is_self("127.0.0.1", 3122));
        assert!(!config.is_self("other", 3121));
    }
}
