//! DNS-challenge validation records returned by the certificate authority.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    PendingValidation,
    Success,
    Failed,
}

/// One DNS record the authority requires before it issues the certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub domain: String,
    pub record_name: String,
    pub record_type: String,
    pub record_value: String,
    pub status: ValidationStatus,
}

/// TLS state of a tenant stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SslStatus {
    Pending,
    Issued,
    /// Temporary lower-guarantee path: no TLS termination at the balancer.
    Bypassed,
}
