use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

/// Local cluster credentials for the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCredentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub tenant_name: String,
}

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    pub listen_addr: String,
    pub cluster_provider: String,
    pub credentials: Option<ClusterCredentials>,
    pub recv_port: u16,
    pub schedule_poll_attempts: u32,
    pub schedule_poll_interval: Duration,
    pub forward_bind_addr: String,
    pub forward_timeout: Duration,
    pub flavor_match_disk: bool,
    pub flavor_auto_create: bool,
    pub transfer_command: String,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl HandoffConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; every value has a default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
        let password = get("OS_PASSWORD_FILE")
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| get("OS_PASSWORD"));
        let credentials = match (get("OS_AUTH_URL"), get("OS_USERNAME"), password, get("OS_TENANT_NAME")) {
            (Some(auth_url), Some(username), Some(password), Some(tenant_name)) => Some(ClusterCredentials {
                auth_url,
                username,
                password,
                tenant_name,
            }),
            _ => None,
        };

        Self {
            listen_addr: get("HANDOFF_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8774".to_string()),
            cluster_provider: get("CLUSTER_PROVIDER")
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or_else(|| "openstack".to_string()),
            credentials,
            recv_port: parse_or(get("HANDOFF_RECV_PORT"), 8022),
            schedule_poll_attempts: parse_or(get("HANDOFF_SCHEDULE_POLL_ATTEMPTS"), 30),
            schedule_poll_interval: Duration::from_millis(parse_or(get("HANDOFF_SCHEDULE_POLL_INTERVAL_MS"), 100)),
            forward_bind_addr: get("HANDOFF_FORWARD_BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string()),
            forward_timeout: Duration::from_secs(parse_or(get("HANDOFF_FORWARD_TIMEOUT_SECS"), 600)),
            flavor_match_disk: parse_flag(get("FLAVOR_MATCH_DISK")),
            flavor_auto_create: parse_flag(get("FLAVOR_AUTO_CREATE")),
            transfer_command: get("HANDOFF_TRANSFER_COMMAND").unwrap_or_else(|| "cloudlet-handoff".to_string()),
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    match raw {
        Some(value) => value.parse().unwrap_or_else(|_| {
            tracing::warn!("[config] ignoring unparsable value {:?}", value);
            default
        }),
        None => default,
    }
}

fn parse_flag(raw: Option<String>) -> bool {
    matches!(
        raw.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = HandoffConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8774");
        assert_eq!(cfg.cluster_provider, "openstack");
        assert_eq!(cfg.recv_port, 8022);
        assert_eq!(cfg.schedule_poll_attempts, 30);
        assert_eq!(cfg.schedule_poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.forward_timeout, Duration::from_secs(600));
        assert!(!cfg.flavor_match_disk);
        assert!(!cfg.flavor_auto_create);
        assert!(cfg.credentials.is_none());
    }

    #[test]
    fn overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = [
            ("CLUSTER_PROVIDER", "Mock"),
            ("HANDOFF_RECV_PORT", "not-a-port"),
            ("HANDOFF_SCHEDULE_POLL_ATTEMPTS", "5"),
            ("FLAVOR_MATCH_DISK", "true"),
            ("OS_AUTH_URL", "http://ctl:5000/v2.0"),
            ("OS_USERNAME", "admin"),
            ("OS_PASSWORD", "pw"),
            ("OS_TENANT_NAME", "demo"),
        ]
        .into_iter()
        .collect();
        let cfg = HandoffConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.cluster_provider, "mock");
        assert_eq!(cfg.recv_port, 8022);
        assert_eq!(cfg.schedule_poll_attempts, 5);
        assert!(cfg.flavor_match_disk);
        assert_eq!(cfg.credentials.unwrap().tenant_name, "demo");
    }
}
