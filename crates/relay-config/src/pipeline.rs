// ============================================================================
// Pipeline Configuration
// ============================================================================
//
// Dedup window, listener reconnect policy, process roles and generator knobs.
//
// ============================================================================

use crate::constants::*;
use crate::{env_or, env_parse};
use anyhow::{Result, bail};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct DedupConfig {
    /// Lifetime of a dedup marker; duplicates inside it are dropped
    pub window: Duration,
}

impl DedupConfig {
    pub(crate) fn from_env() -> Result<Self> {
        let window = Duration::from_millis(env_parse("DEDUP_WINDOW_MS", DEFAULT_DEDUP_WINDOW_MS)?);
        if window.is_zero() {
            bail!("DEDUP_WINDOW_MS must be greater than zero");
        }
        Ok(Self { window })
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_DEDUP_WINDOW_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Pause between a broken subscription and the next attempt
    pub reconnect_backoff: Duration,
}

impl ListenerConfig {
    pub(crate) fn from_env() -> Result<Self> {
        Ok(Self {
            reconnect_backoff: Duration::from_millis(env_parse(
                "LISTENER_RECONNECT_BACKOFF_MS",
                DEFAULT_RECONNECT_BACKOFF_MS,
            )?),
        })
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
        }
    }
}

/// Which halves of the pipeline this process runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RolesConfig {
    /// Listen for expirations and forward the deduplicated ones
    pub forwarder: bool,
    /// Join the consumer group and process work items
    pub consumer: bool,
}

impl RolesConfig {
    pub(crate) fn from_env() -> Result<Self> {
        Self::parse(&env_or("RELAY_ROLES", "forwarder,consumer"))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut roles = Self {
            forwarder: false,
            consumer: false,
        };
        for role in raw.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            match role {
                "forwarder" => roles.forwarder = true,
                "consumer" => roles.consumer = true,
                other => bail!("unknown role '{}' in RELAY_ROLES", other),
            }
        }
        if !roles.forwarder && !roles.consumer {
            bail!("RELAY_ROLES must enable at least one of: forwarder, consumer");
        }
        Ok(roles)
    }
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            forwarder: true,
            consumer: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub num_keys: u64,
    /// Pause between two generated keys
    pub key_delay: Duration,
    /// TTL of each generated record
    pub key_ttl: Duration,
    /// Timeout for a single write
    pub op_timeout: Duration,
}

impl GeneratorConfig {
    pub(crate) fn from_env() -> Result<Self> {
        Ok(Self {
            num_keys: env_parse("GENERATOR_NUM_KEYS", DEFAULT_GENERATOR_NUM_KEYS)?,
            key_delay: Duration::from_millis(env_parse(
                "GENERATOR_KEY_DELAY_MS",
                DEFAULT_GENERATOR_KEY_DELAY_MS,
            )?),
            key_ttl: Duration::from_millis(env_parse(
                "GENERATOR_KEY_TTL_MS",
                DEFAULT_GENERATOR_KEY_TTL_MS,
            )?),
            op_timeout: Duration::from_millis(env_parse(
                "GENERATOR_OP_TIMEOUT_MS",
                DEFAULT_GENERATOR_OP_TIMEOUT_MS,
            )?),
        })
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            num_keys: DEFAULT_GENERATOR_NUM_KEYS,
            key_delay: Duration::from_millis(DEFAULT_GENERATOR_KEY_DELAY_MS),
            key_ttl: Duration::from_millis(DEFAULT_GENERATOR_KEY_TTL_MS),
            op_timeout: Duration::from_millis(DEFAULT_GENERATOR_OP_TIMEOUT_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_parsing() {
        let roles = RolesConfig::parse("consumer").unwrap();
        assert!(roles.consumer);
        assert!(!roles.forwarder);

        let roles = RolesConfig::parse(" forwarder , consumer ").unwrap();
        assert_eq!(roles, RolesConfig::default());

        assert!(RolesConfig::parse("").is_err());
        assert!(RolesConfig::parse("generator").is_err());
    }
}
