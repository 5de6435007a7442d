use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EXPIRY_WARNING_DAYS: i64 = 30;

/// Public, read-only description of a signing certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateHandle {
    /// SHA-256 of the DER encoding, uppercase hex.
    pub thumbprint: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial_number: String,
}

impl CertificateHandle {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    pub fn is_currently_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Whole days left, truncated. Negative once expired.
    pub fn days_until_expiry_at(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    pub fn days_until_expiry(&self) -> i64 {
        self.days_until_expiry_at(Utc::now())
    }

    pub fn is_expiring_soon_at(&self, now: DateTime<Utc>) -> bool {
        let days = self.days_until_expiry_at(now);
        self.is_valid_at(now) && days > 0 && days <= EXPIRY_WARNING_DAYS
    }

    pub fn is_expiring_soon(&self) -> bool {
        self.is_expiring_soon_at(Utc::now())
    }

    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }
}
