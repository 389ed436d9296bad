//! Provisioning configuration, loaded from `TS_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::poll::PollSettings;

#[derive(Clone, Debug)]
pub struct ProvisionerConfig {
    /// Parent domain; tenants live at `{tenant_id}.{base_domain}`.
    pub base_domain: String,
    /// Provider region, passed through as a tag and a log field.
    pub region: String,
    /// Skip TLS entirely: no certificate, HTTP listener, allow-all CDN.
    pub ssl_bypass: bool,
    pub certificate_poll: PollSettings,
    /// Waiting for a new certificate's challenge records to appear.
    pub challenge_poll: PollSettings,
    pub database_poll: PollSettings,
    pub services_poll: PollSettings,
    pub secret_recovery_days: u32,
    pub max_concurrent_provisions: usize,
    /// Registry prefix for service images.
    pub image_registry: String,
    pub image_tag: String,
    pub dns_ttl: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            base_domain: "tenantstack.test".to_string(),
            region: "us-east-1".to_string(),
            ssl_bypass: false,
            certificate_poll: PollSettings::new(30, 30 * 60, 120),
            challenge_poll: PollSettings::new(5, 60, 30),
            database_poll: PollSettings::new(30, 30 * 60, 120),
            services_poll: PollSettings::new(5, 5 * 60, 60),
            secret_recovery_days: 7,
            max_concurrent_provisions: 4,
            image_registry: "registry.tenantstack.test".to_string(),
            image_tag: "stable".to_string(),
            dns_ttl: 300,
        }
    }
}

impl ProvisionerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();

        let base_domain = std::env::var("TS_BASE_DOMAIN").unwrap_or(d.base_domain);
        let region = std::env::var("TS_REGION").unwrap_or(d.region);
        let ssl_bypass = std::env::var("TS_SSL_BYPASS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let certificate_poll = PollSettings {
            interval: env_secs("TS_CERT_POLL_SECS", d.certificate_poll.interval),
            max_wait: env_secs("TS_CERT_MAX_WAIT_SECS", d.certificate_poll.max_wait),
            ..d.certificate_poll
        };
        let database_poll = PollSettings {
            interval: env_secs("TS_DB_POLL_SECS", d.database_poll.interval),
            max_wait: env_secs("TS_DB_MAX_WAIT_SECS", d.database_poll.max_wait),
            ..d.database_poll
        };
        let services_poll = PollSettings {
            interval: env_secs("TS_SERVICES_POLL_SECS", d.services_poll.interval),
            max_wait: env_secs("TS_SERVICES_MAX_WAIT_SECS", d.services_poll.max_wait),
            ..d.services_poll
        };

        if ssl_bypass {
            tracing::warn!("TS_SSL_BYPASS set -- tenants will be served without TLS");
        }

        Self {
            base_domain,
            region,
            ssl_bypass,
            certificate_poll,
            challenge_poll: d.challenge_poll,
            database_poll,
            services_poll,
            secret_recovery_days: env_parse("TS_SECRET_RECOVERY_DAYS", d.secret_recovery_days),
            max_concurrent_provisions: env_parse("TS_MAX_CONCURRENT", d.max_concurrent_provisions),
            image_registry: std::env::var("TS_IMAGE_REGISTRY").unwrap_or(d.image_registry),
            image_tag: std::env::var("TS_IMAGE_TAG").unwrap_or(d.image_tag),
            dns_ttl: env_parse("TS_DNS_TTL", d.dns_ttl),
        }
    }
}

/// Where the binaries find the provider gateway, the store and the webhook secret.
#[derive(Clone, Debug, Default)]
pub struct BackendConfig {
    pub gateway_url: Option<String>,
    pub gateway_token: String,
    pub gateway_timeout: Duration,
    pub database_url: Option<String>,
    pub webhook_secret: String,
}

impl BackendConfig {
    pub fn from_env() -> Self {
        let gateway_url = std::env::var("TS_GATEWAY_URL").ok().filter(|s| !s.is_empty());
        let gateway_token = std::env::var("TS_GATEWAY_TOKEN").unwrap_or_default();
        let webhook_secret = std::env::var("TS_WEBHOOK_SECRET").unwrap_or_default();
        let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());

        if gateway_url.is_some() && gateway_token.is_empty() {
            tracing::warn!("TS_GATEWAY_TOKEN not set -- gateway calls are unauthenticated");
        }
        if webhook_secret.is_empty() {
            tracing::warn!("TS_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }

        Self {
            gateway_url,
            gateway_token,
            gateway_timeout: env_secs("TS_GATEWAY_TIMEOUT_SECS", Duration::from_secs(30)),
            database_url,
            webhook_secret,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_polling_policy() {
        let config = ProvisionerConfig::default();
        assert_eq!(config.certificate_poll.interval, Duration::from_secs(30));
        assert_eq!(config.certificate_poll.max_wait, Duration::from_secs(1800));
        assert_eq!(config.database_poll.log_every, Duration::from_secs(120));
        assert_eq!(config.secret_recovery_days, 7);
        assert!(!config.ssl_bypass);
    }

    #[test]
    fn unparsable_values_fall_back() {
        assert_eq!(env_parse("TS_TEST_SURELY_UNSET_VAR", 9usize), 9);
        assert_eq!(
            env_secs("TS_TEST_SURELY_UNSET_VAR", Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }
}
