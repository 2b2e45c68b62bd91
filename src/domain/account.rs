//! Account entity and registration state machine

use crate::domain::shared::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Registration lifecycle of one account. Exactly one state per account at any
/// instant; `AboutToExpire` is entered only from `Registered` once the remaining
/// validity drops under the configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    AboutToExpire,
    Expired,
}

/// Provisioning fields posted by the host application, either through the
/// admin HTTP channel or pre-seeded through the lifecycle call at cold start.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningData {
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Registrar address (host or host:port)
    pub domain: String,
    #[serde(default = "default_expires")]
    pub expires: u32,
    #[serde(default)]
    pub premium: bool,
    /// Push token/selector handed back with every notification
    #[serde(default)]
    pub selector: String,
    /// Transport toward the registrar: udp (default), tcp or tls
    #[serde(default)]
    pub transport: Option<String>,
}

fn default_expires() -> u32 {
    600
}

impl ProvisioningData {
    /// Parse a URL-encoded provisioning blob.
    pub fn parse(post_data: &str) -> Result<Self> {
        let data: ProvisioningData = serde_urlencoded::from_str(post_data)
            .map_err(|e| EngineError::Registration(format!("bad provisioning data: {}", e)))?;
        if data.username.is_empty() {
            return Err(EngineError::Registration(
                "provisioning data has empty username".to_string(),
            ));
        }
        if data.domain.is_empty() {
            return Err(EngineError::Registration(
                "provisioning data has empty registrar address".to_string(),
            ));
        }
        Ok(data)
    }
}

/// Retry bookkeeping for failed registration attempts. Backoff doubles per
/// attempt starting at five seconds and is capped by the account's max age.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryState {
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// A SIP endpoint under management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Identity key: user@registrar-address
    pub id: String,
    pub username: String,
    pub password: String,
    pub domain: String,
    pub requested_expires: u32,
    pub premium: bool,
    pub selector: String,
    pub transport: Option<String>,
    pub state: RegistrationState,
    /// Expiry of the current registration, when registered
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful registration activity
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry: RetryState,
    /// Set once the one-shot about-to-expire notification fired for the
    /// current registration
    #[serde(default)]
    pub about_to_expire_notified: bool,
    /// Last time the periodic about-to-expire notification fired
    #[serde(default)]
    pub last_periodic_notice: Option<DateTime<Utc>>,
}

impl Account {
    pub fn from_provisioning(data: ProvisioningData) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}@{}", data.username, data.domain),
            username: data.username,
            password: data.password,
            domain: data.domain,
            requested_expires: data.expires,
            premium: data.premium,
            selector: data.selector,
            transport: data.transport,
            state: RegistrationState::Unregistered,
            expires_at: None,
            last_seen: now,
            created_at: now,
            retry: RetryState::default(),
            about_to_expire_notified: false,
            last_periodic_notice: None,
        }
    }

    /// Maximum registration age for this account under the configured caps.
    pub fn max_age(&self, max_age: Duration, premium_max_age: Duration) -> Duration {
        if self.premium {
            premium_max_age
        } else {
            max_age
        }
    }

    /// Remaining validity of the current registration.
    pub fn remaining_validity(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.map(|at| at - now)
    }

    pub fn is_registered(&self) -> bool {
        matches!(
            self.state,
            RegistrationState::Registered | RegistrationState::AboutToExpire
        )
    }

    /// Enter `Registering`. Valid from every state; re-registering an
    /// already-registered account is a refresh, not an error.
    pub fn begin_registration(&mut self) {
        self.state = RegistrationState::Registering;
    }

    /// A REGISTER transaction completed with 200.
    pub fn registration_succeeded(&mut self, granted_expires: u32, now: DateTime<Utc>) {
        self.state = RegistrationState::Registered;
        self.expires_at = Some(now + Duration::seconds(granted_expires as i64));
        self.last_seen = now;
        self.retry = RetryState::default();
        self.about_to_expire_notified = false;
        self.last_periodic_notice = None;
    }

    /// A REGISTER transaction was rejected or timed out; schedule the next
    /// attempt with doubling backoff capped by the account's max age.
    pub fn registration_failed(&mut self, now: DateTime<Utc>, cap: Duration) {
        if !self.is_registered() {
            self.state = RegistrationState::Unregistered;
        }
        self.retry.attempts = self.retry.attempts.saturating_add(1);
        let backoff = Duration::seconds(5i64.saturating_mul(1i64 << self.retry.attempts.min(12)));
        let backoff = if backoff > cap { cap } else { backoff };
        self.retry.next_attempt_at = Some(now + backoff);
    }

    /// Whether a retry is due.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        match self.retry.next_attempt_at {
            Some(at) => now >= at,
            None => false,
        }
    }

    /// Enter `AboutToExpire`. Only valid from `Registered`.
    pub fn mark_about_to_expire(&mut self) -> Result<()> {
        if self.state != RegistrationState::Registered {
            return Err(EngineError::Registration(format!(
                "account {} cannot enter AboutToExpire from {:?}",
                self.id, self.state
            )));
        }
        self.state = RegistrationState::AboutToExpire;
        Ok(())
    }

    /// Registration validity ran out.
    pub fn mark_expired(&mut self) {
        self.state = RegistrationState::Expired;
        self.expires_at = None;
    }

    /// True when the account exceeded `NotRegisteredMaxAge` without a single
    /// successful (re-)registration and should be evicted.
    pub fn eviction_due(&self, now: DateTime<Utc>, not_registered_max_age: Duration) -> bool {
        !self.is_registered() && now - self.last_seen > not_registered_max_age
    }
}
