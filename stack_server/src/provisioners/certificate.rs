//! Wildcard certificate provisioning with DNS-challenge validation.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::dns::DnsRecordManager;
use crate::config::ProvisionerConfig;
use crate::error::StageError;
use crate::models::ValidationRecord;
use crate::naming::{MANAGED_BY, TAG_MANAGED_BY};
use crate::poll::{poll_until, Poll, PollSettings};
use crate::providers::{
    CertificateDescription, CertificateRequest, CertificateService, CertificateStatus, Tags,
};

#[derive(Debug, Clone)]
pub struct CertificateOutcome {
    pub certificate_ref: String,
    pub validation_records: Vec<ValidationRecord>,
    /// An existing certificate was used instead of requesting one.
    pub reused: bool,
}

pub struct CertificateProvisioner {
    certificates: Arc<dyn CertificateService>,
    dns: DnsRecordManager,
    challenge_poll: PollSettings,
    issue_poll: PollSettings,
}

impl CertificateProvisioner {
    pub fn new(
        certificates: Arc<dyn CertificateService>,
        dns: DnsRecordManager,
        config: &ProvisionerConfig,
    ) -> Self {
        Self {
            certificates,
            dns,
            challenge_poll: config.challenge_poll,
            issue_poll: config.certificate_poll,
        }
    }

    /// Make sure an issued certificate covers `*.{domain}` and `{domain}`.
    pub async fn ensure_certificate(
        &self,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<CertificateOutcome, StageError> {
        let wildcard = format!("*.{domain}");
        let existing = self
            .certificates
            .list_certificates()
            .await
            .map_err(StageError::api("ListCertificates"))?;

        let covering: Vec<&CertificateDescription> = existing
            .iter()
            .filter(|c| covers(c, &wildcard, domain))
            .collect();

        if let Some(issued) = covering.iter().find(|c| is_current(c)) {
            tracing::info!(%domain, arn = %issued.arn, "reusing issued certificate");
            return Ok(CertificateOutcome {
                certificate_ref: issued.arn.clone(),
                validation_records: issued.validation_records.clone(),
                reused: true,
            });
        }

        let (arn, reused) = match covering
            .iter()
            .find(|c| c.status == CertificateStatus::PendingValidation)
        {
            Some(pending) => {
                tracing::info!(%domain, arn = %pending.arn, "resuming validation of pending certificate");
                (pending.arn.clone(), true)
            }
            None => {
                let request = CertificateRequest {
                    domain: wildcard.clone(),
                    subject_alternative_names: vec![domain.to_string()],
                    idempotency_token: idempotency_token(domain),
                    tags: Tags::from([(TAG_MANAGED_BY.to_string(), MANAGED_BY.to_string())]),
                };
                let arn = self
                    .certificates
                    .request_certificate(&request)
                    .await
                    .map_err(StageError::api("RequestCertificate"))?;
                tracing::info!(%domain, %arn, "requested wildcard certificate");
                (arn, false)
            }
        };

        let records = self.challenge_records(&arn, cancel).await?;
        self.publish_challenges(&records).await?;

        let certificates = &self.certificates;
        let arn_ref = arn.as_str();
        let issued = poll_until(
            &format!("certificate {arn}"),
            &self.issue_poll,
            cancel,
            || async move {
                let desc = certificates
                    .describe_certificate(arn_ref)
                    .await
                    .map_err(StageError::api("DescribeCertificate"))?;
                match desc.status {
                    CertificateStatus::Issued => Ok(Poll::Ready(desc)),
                    CertificateStatus::PendingValidation => {
                        Ok(Poll::Pending("PENDING_VALIDATION".to_string()))
                    }
                    CertificateStatus::Failed
                    | CertificateStatus::Expired
                    | CertificateStatus::Revoked => {
                        Err(StageError::CertificateFailed(arn_ref.to_string()))
                    }
                }
            },
        )
        .await?;

        tracing::info!(%domain, %arn, "certificate issued");
        Ok(CertificateOutcome {
            certificate_ref: issued.arn,
            validation_records: issued.validation_records,
            reused,
        })
    }

    /// Challenge records show up a little after the request.
    async fn challenge_records(
        &self,
        arn: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ValidationRecord>, StageError> {
        let certificates = &self.certificates;
        poll_until(
            &format!("challenge records for {arn}"),
            &self.challenge_poll,
            cancel,
            || async move {
                let desc = certificates
                    .describe_certificate(arn)
                    .await
                    .map_err(StageError::api("DescribeCertificate"))?;
                if desc.validation_records.is_empty() {
                    Ok(Poll::Pending("no challenge records yet".to_string()))
                } else {
                    Ok(Poll::Ready(desc.validation_records))
                }
            },
        )
        .await
    }

    /// Wildcard and apex usually share one challenge record; publish each once.
    async fn publish_challenges(&self, records: &[ValidationRecord]) -> Result<(), StageError> {
        let mut seen = BTreeSet::new();
        for record in records {
            if !seen.insert((&record.record_name, &record.record_type)) {
                continue;
            }
            self.dns
                .upsert_record(&record.record_name, &record.record_type, &record.record_value)
                .await?;
        }
        Ok(())
    }
}

fn covers(cert: &CertificateDescription, wildcard: &str, apex: &str) -> bool {
    let names: Vec<&str> = std::iter::once(cert.domain.as_str())
        .chain(cert.subject_alternative_names.iter().map(String::as_str))
        .collect();
    names.contains(&wildcard) && names.contains(&apex)
}

fn is_current(cert: &CertificateDescription) -> bool {
    cert.status == CertificateStatus::Issued && cert.not_after.is_none_or(|t| t > Utc::now())
}

/// Same domain, same token: repeated requests return the same certificate.
fn idempotency_token(domain: &str) -> String {
    hex::encode(Sha256::digest(domain.as_bytes()))[..32].to_string()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn cert(status: CertificateStatus, not_after: Option<chrono::DateTime<Utc>>) -> CertificateDescription {
        CertificateDescription {
            arn: "arn:1".into(),
            domain: "*.example.com".into(),
            subject_alternative_names: vec!["example.com".into()],
            status,
            not_after,
            validation_records: vec![],
        }
    }

    #[test]
    fn coverage_needs_wildcard_and_apex() {
        let c = cert(CertificateStatus::Issued, None);
        assert!(covers(&c, "*.example.com", "example.com"));
        assert!(!covers(&c, "*.other.com", "other.com"));
    }

    #[test]
    fn expired_certificates_are_not_current() {
        assert!(is_current(&cert(
            CertificateStatus::Issued,
            Some(Utc::now() + Duration::days(30))
        )));
        assert!(!is_current(&cert(
            CertificateStatus::Issued,
            Some(Utc::now() - Duration::days(1))
        )));
        assert!(!is_current(&cert(CertificateStatus::PendingValidation, None)));
    }

    #[test]
    fn idempotency_token_is_stable() {
        assert_eq!(idempotency_token("example.com"), idempotency_token("example.com"));
        assert_eq!(idempotency_token("example.com").len(), 32);
    }
}
