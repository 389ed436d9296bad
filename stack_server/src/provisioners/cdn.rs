//! Edge distribution in front of the tenant's load balancer.

use std::sync::Arc;

use uuid::Uuid;

use super::{find_or_create, ignore_missing};
use crate::error::StageError;
use crate::models::CdnHandle;
use crate::naming::ResourceNames;
use crate::providers::{CdnService, DistributionSpec, ViewerProtocolPolicy};

pub struct CdnProvisioner {
    cdn: Arc<dyn CdnService>,
}

impl CdnProvisioner {
    pub fn new(cdn: Arc<dyn CdnService>) -> Self {
        Self { cdn }
    }

    /// Find or create the tenant's distribution, keyed by caller reference.
    /// `certificate_ref = None` serves the alias over plain HTTP.
    pub async fn create_distribution(
        &self,
        names: &ResourceNames,
        origin_domain: &str,
        host: &str,
        certificate_ref: Option<&str>,
    ) -> Result<CdnHandle, StageError> {
        let spec = distribution_spec(names, origin_domain, host, certificate_ref);
        let cdn = &self.cdn;
        let (caller_ref, spec) = (spec.caller_reference.as_str(), &spec);
        let ensured = find_or_create(
            "CreateDistribution",
            || async move { cdn.find_distribution(caller_ref).await },
            || async move { cdn.create_distribution(spec).await },
        )
        .await?;

        let created = ensured.was_created();
        let distribution = ensured.into_inner();
        tracing::info!(
            tenant_id = names.tenant_id(),
            distribution = %distribution.id,
            domain = %distribution.domain_name,
            created,
            "CDN distribution ready"
        );
        Ok(CdnHandle {
            distribution_id: distribution.id,
            domain: distribution.domain_name,
        })
    }

    /// Returns the invalidation id.
    pub async fn invalidate(&self, distribution_id: &str, paths: &[String]) -> Result<String, StageError> {
        self.cdn
            .create_invalidation(distribution_id, paths, &Uuid::new_v4().to_string())
            .await
            .map_err(StageError::api("CreateInvalidation"))
    }

    /// Remove a distribution a failed CDN stage may have created.
    pub async fn delete_leftover(&self, names: &ResourceNames) -> Result<Option<String>, StageError> {
        let found = self
            .cdn
            .find_distribution(&names.distribution_ref())
            .await
            .map_err(StageError::api("FindDistribution"))?;
        match found {
            Some(distribution) => {
                self.delete_distribution(&distribution.id).await?;
                Ok(Some(distribution.id))
            }
            None => Ok(None),
        }
    }

    /// Disable, then delete. `false` when the distribution was already gone.
    pub async fn delete_distribution(&self, distribution_id: &str) -> Result<bool, StageError> {
        let disabled = ignore_missing(self.cdn.update_distribution(distribution_id, false).await)
            .map_err(StageError::api("UpdateDistribution"))?;
        if disabled.is_none() {
            return Ok(false);
        }
        let deleted = ignore_missing(self.cdn.delete_distribution(distribution_id).await)
            .map_err(StageError::api("DeleteDistribution"))?;
        Ok(deleted.is_some())
    }
}

fn distribution_spec(
    names: &ResourceNames,
    origin_domain: &str,
    host: &str,
    certificate_ref: Option<&str>,
) -> DistributionSpec {
    let tls = certificate_ref.is_some();
    DistributionSpec {
        caller_reference: names.distribution_ref(),
        origin_domain: origin_domain.to_string(),
        origin_https: tls,
        aliases: vec![host.to_string()],
        certificate_arn: certificate_ref.map(str::to_string),
        viewer_protocol_policy: if tls {
            ViewerProtocolPolicy::HttpsOnly
        } else {
            ViewerProtocolPolicy::AllowAll
        },
        compress: true,
        comment: format!("tenant {}", names.tenant_id()),
        tags: names.tags(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_follows_certificate() {
        let names = ResourceNames::new("acme-1");
        let tls = distribution_spec(&names, "lb.elb", "acme-1.example.com", Some("cert"));
        assert_eq!(tls.viewer_protocol_policy, ViewerProtocolPolicy::HttpsOnly);
        assert!(tls.origin_https);
        assert_eq!(tls.caller_reference, "tenantstack-acme-1");

        let plain = distribution_spec(&names, "lb.elb", "acme-1.example.com", None);
        assert_eq!(plain.viewer_protocol_policy, ViewerProtocolPolicy::AllowAll);
        assert!(!plain.origin_https);
        assert!(plain.compress);
        assert_eq!(plain.aliases, vec!["acme-1.example.com".to_string()]);
    }
}
