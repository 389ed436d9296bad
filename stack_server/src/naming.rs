//! Tenant-scoped resource names.
//!
//! Every per-tenant name is derived from the tenant id here and nowhere
//! else. Tenant ids never contain `--`, so a shortened name (which always
//! does) cannot equal the plain name of another tenant.

use sha2::{Digest, Sha256};

use crate::providers::Tags;

/// Load balancer and target group names are capped by the provider.
pub const LB_NAME_MAX: usize = 32;

pub const SHARED_SUBNET_GROUP: &str = "tenantstack-shared";
pub const DB_SECURITY_GROUP: &str = "tenantstack-db-access";
pub const LB_SECURITY_GROUP: &str = "tenantstack-lb-public";

pub const TAG_TENANT: &str = "tenant";
pub const TAG_MANAGED_BY: &str = "managed-by";
pub const MANAGED_BY: &str = "tenantstack";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    tenant_id: String,
}

impl ResourceNames {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn db_instance(&self) -> String {
        format!("{}-db", self.tenant_id)
    }

    pub fn database_secret(&self) -> String {
        format!("tenants/{}/database", self.tenant_id)
    }

    pub fn integrations_secret(&self) -> String {
        format!("tenants/{}/integrations", self.tenant_id)
    }

    pub fn load_balancer(&self) -> String {
        bounded(&self.tenant_id, "alb", LB_NAME_MAX)
    }

    pub fn target_group(&self) -> String {
        bounded(&self.tenant_id, "tg", LB_NAME_MAX)
    }

    pub fn distribution_ref(&self) -> String {
        format!("tenantstack-{}", self.tenant_id)
    }

    pub fn stack(&self) -> String {
        format!("tenant-{}", self.tenant_id)
    }

    pub fn host(&self, base_domain: &str) -> String {
        format!("{}.{}", self.tenant_id, base_domain)
    }

    /// Database name for one service, e.g. `acme_1_crm`.
    pub fn service_database(&self, service: &str) -> String {
        format!("{}_{service}", self.tenant_id.replace('-', "_"))
    }

    /// Master username with a random suffix, e.g. `acme_1_a8k2qz`.
    pub fn db_username(&self, suffix: &str) -> String {
        let base: String = self.tenant_id.replace('-', "_").chars().take(40).collect();
        format!("{base}_{suffix}")
    }

    pub fn final_snapshot(&self, unix_secs: i64) -> String {
        format!("{}-final-{unix_secs}", self.db_instance())
    }

    pub fn upgrade_snapshot(&self, unix_secs: i64) -> String {
        format!("{}-upgrade-{unix_secs}", self.db_instance())
    }

    pub fn tags(&self) -> Tags {
        Tags::from([
            (TAG_TENANT.to_string(), self.tenant_id.clone()),
            (TAG_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        ])
    }
}

/// `{id}-{suffix}` when it fits, else a truncated id plus a hash of the full id.
fn bounded(id: &str, suffix: &str, max: usize) -> String {
    let plain = format!("{id}-{suffix}");
    if plain.len() <= max {
        return plain;
    }
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    let hash = &digest[..6];
    let keep = max - suffix.len() - hash.len() - 3;
    let prefix = id[..keep].trim_end_matches('-');
    format!("{prefix}--{hash}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_keep_plain_names() {
        let names = ResourceNames::new("acme-1");
        assert_eq!(names.load_balancer(), "acme-1-alb");
        assert_eq!(names.target_group(), "acme-1-tg");
        assert_eq!(names.database_secret(), "tenants/acme-1/database");
        assert_eq!(names.service_database("crm"), "acme_1_crm");
    }

    #[test]
    fn long_ids_are_shortened_within_limit() {
        let a = ResourceNames::new("northwind-traders-international-holdings");
        let b = ResourceNames::new("northwind-traders-international-holdingz");
        for name in [a.load_balancer(), a.target_group(), b.load_balancer()] {
            assert!(name.len() <= LB_NAME_MAX, "{name} too long");
            assert!(name.contains("--"));
        }
        assert_ne!(a.load_balancer(), b.load_balancer());
        assert_eq!(a.load_balancer(), a.load_balancer());
    }

    #[test]
    fn boundary_length_is_not_shortened() {
        // 28 chars + "-alb" is exactly 32.
        let id = "abcdefghij-klmnopqrst-uvwxyz";
        assert_eq!(id.len(), 28);
        assert_eq!(ResourceNames::new(id).load_balancer(), format!("{id}-alb"));
    }

    #[test]
    fn tags_name_the_tenant() {
        let tags = ResourceNames::new("acme-1").tags();
        assert_eq!(tags.get("tenant").map(String::as_str), Some("acme-1"));
        assert_eq!(tags.get("managed-by").map(String::as_str), Some("tenantstack"));
    }
}
