// # Certificate Manager Trait
//
// Certificate acquisition (ACME challenges, account keys, storage) is
// delegated. The controller only asks for a renewal on a long interval
// and logs the outcome.

use async_trait::async_trait;

use crate::model::CertMode;

/// Outcome of a renewal attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// A new certificate was issued
    Renewed,
    /// The current certificate is not due for renewal
    NotDue,
}

/// Trait for certificate lifecycle implementations
#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Renew the certificate for `domain` using `mode`'s challenge type
    async fn renew(&self, mode: CertMode, domain: &str) -> Result<RenewOutcome, crate::Error>;
}
