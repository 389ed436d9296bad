//! Tenant configuration: the immutable input of a provisioning run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static TENANT_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)*$").expect("valid tenant id regex"));
static INTEGRATION_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid integration regex"));

pub const TENANT_ID_MIN_LEN: usize = 3;
pub const TENANT_ID_MAX_LEN: usize = 40;

/// Paid plan refinement of the account tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaidPlan {
    Basic,
    Professional,
}

/// Account tier. Serialized as `trial`, `paid/basic` or `paid/professional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AccountTier {
    Trial,
    Paid(PaidPlan),
}

impl AccountTier {
    pub fn is_trial(&self) -> bool {
        matches!(self, AccountTier::Trial)
    }

    pub fn is_professional(&self) -> bool {
        matches!(self, AccountTier::Paid(PaidPlan::Professional))
    }

    /// Ordering used to tell upgrades from downgrades.
    pub fn rank(&self) -> u8 {
        match self {
            AccountTier::Trial => 0,
            AccountTier::Paid(PaidPlan::Basic) => 1,
            AccountTier::Paid(PaidPlan::Professional) => 2,
        }
    }
}

impl fmt::Display for AccountTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountTier::Trial => f.write_str("trial"),
            AccountTier::Paid(PaidPlan::Basic) => f.write_str("paid/basic"),
            AccountTier::Paid(PaidPlan::Professional) => f.write_str("paid/professional"),
        }
    }
}

impl FromStr for AccountTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" => Ok(AccountTier::Trial),
            "paid" | "paid/basic" | "basic" => Ok(AccountTier::Paid(PaidPlan::Basic)),
            "paid/professional" | "professional" => Ok(AccountTier::Paid(PaidPlan::Professional)),
            other => Err(format!("unknown account tier '{other}'")),
        }
    }
}

impl TryFrom<String> for AccountTier {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccountTier> for String {
    fn from(tier: AccountTier) -> Self {
        tier.to_string()
    }
}

/// Optional application features; add-on containers are gated on these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub booking: bool,
    pub file_portal: bool,
    pub analytics: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            booking: false,
            file_portal: true,
            analytics: false,
        }
    }
}

/// Pre-existing third-party API keys, keyed by provider name.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntegrationKeys(pub BTreeMap<String, String>);

impl IntegrationKeys {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Debug for IntegrationKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub tier: AccountTier,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default, skip_serializing)]
    pub integrations: IntegrationKeys,
    #[serde(default)]
    pub contact_email: Option<String>,
}

impl TenantConfig {
    pub fn new(tenant_id: impl Into<String>, tier: AccountTier) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            tier,
            features: FeatureFlags::default(),
            integrations: IntegrationKeys::default(),
            contact_email: None,
        }
    }

    /// Check every field; returns the full list of problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        let len = self.tenant_id.len();
        if !(TENANT_ID_MIN_LEN..=TENANT_ID_MAX_LEN).contains(&len) {
            problems.push(format!(
                "tenant_id must be between {TENANT_ID_MIN_LEN} and {TENANT_ID_MAX_LEN} characters (got {len})"
            ));
        }
        if !TENANT_ID_REGEX.is_match(&self.tenant_id) {
            problems.push(format!(
                "tenant_id '{}' must be lowercase letters, digits and single hyphens, starting with a letter",
                self.tenant_id
            ));
        }

        for (name, key) in &self.integrations.0 {
            if !INTEGRATION_NAME_REGEX.is_match(name) {
                problems.push(format!("integration name '{name}' is invalid"));
            }
            if key.trim().is_empty() {
                problems.push(format!("integration '{name}' has an empty key"));
            }
        }

        if let Some(email) = &self.contact_email {
            if !email.contains('@') || email.len() > 254 {
                problems.push("contact_email is not a valid address".to_string());
            }
        }

        if self.features.booking && self.tier.is_trial() {
            tracing::debug!(
                tenant_id = %self.tenant_id,
                "booking requested on trial tier; add-on will not be deployed"
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Public host name of the tenant under the platform's base domain.
    pub fn host(&self, base_domain: &str) -> String {
        format!("{}.{}", self.tenant_id, base_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parses_text_forms() {
        assert_eq!("trial".parse::<AccountTier>().unwrap(), AccountTier::Trial);
        assert_eq!(
            "paid".parse::<AccountTier>().unwrap(),
            AccountTier::Paid(PaidPlan::Basic)
        );
        assert_eq!(
            "Paid/Professional".parse::<AccountTier>().unwrap(),
            AccountTier::Paid(PaidPlan::Professional)
        );
        assert!("enterprise".parse::<AccountTier>().is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: TenantConfig =
            serde_json::from_str(r#"{"tenant_id":"acme-1","tier":"paid/professional"}"#).unwrap();
        assert_eq!(config.tier, AccountTier::Paid(PaidPlan::Professional));
        assert!(config.features.file_portal);
        assert!(config.integrations.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_tenant_ids_are_rejected() {
        for id in ["ab", "Acme", "1acme", "acme--1", "acme-", "acme_1"] {
            let config = TenantConfig::new(id, AccountTier::Trial);
            assert!(config.validate().is_err(), "{id} should be rejected");
        }
        let long = "a".repeat(TENANT_ID_MAX_LEN + 1);
        assert!(TenantConfig::new(long, AccountTier::Trial).validate().is_err());
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = TenantConfig::new("Bad Id", AccountTier::Trial);
        config
            .integrations
            .0
            .insert("Open-AI".to_string(), " ".to_string());
        config.contact_email = Some("nobody".to_string());
        let problems = config.validate().unwrap_err();
        assert!(problems.len() >= 4, "{problems:?}");
    }

    #[test]
    fn integration_keys_are_redacted_in_debug() {
        let mut config = TenantConfig::new("acme-1", AccountTier::Trial);
        config
            .integrations
            .0
            .insert("openai".to_string(), "sk-live-123".to_string());
        let rendered = format!("{config:?}");
        assert!(rendered.contains("openai"));
        assert!(!rendered.contains("sk-live-123"));
    }
}
