//! Engine configuration
//!
//! The settings document is parsed once at startup into this immutable tree and
//! never re-read per request. Path values may carry a `{BASEPATH}` token that is
//! substituted during load and a `$SELECTOR$` token that is resolved per instance.

mod xml;

pub use xml::load_settings;

use crate::domain::filter::FilterRule;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Root of the validated configuration tree.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub http_server: HttpServerSettings,
    pub lock: Option<LockSettings>,
    pub administrator: AdministratorSettings,
    pub database: DatabaseSettings,
    pub log: LogSettings,
    pub tls_client_certificates: Vec<TlsClientCertificate>,
    pub instance: InstanceSettings,
    pub incoming_call: IncomingCallSettings,
    pub message_filter: Vec<FilterRule>,
}

/// SIP listener section
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub name: String,
    pub bind_address: String,
    pub port: u16,
    /// NAT-visible address advertised in Contact headers
    pub public_address: Option<String>,
}

/// Administrative HTTP listener section
#[derive(Debug, Clone)]
pub struct HttpServerSettings {
    pub bind_address: String,
    pub port: u16,
}

impl Default for HttpServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

/// Pid-file lock section
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub pid_file: String,
}

/// Credentials guarding the HTTP administration channel
#[derive(Debug, Clone)]
pub struct AdministratorSettings {
    pub username: String,
    pub password: String,
}

impl Default for AdministratorSettings {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

/// Local store section
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub open_string: String,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    PlainText,
    Json,
}

/// Log verbosity, ordered from most to least severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

/// Per-instance log rule (`<Instance Selector="*">` under `<Log>`)
#[derive(Debug, Clone)]
pub struct InstanceLogRule {
    pub selector: String,
    /// Logging for matching instances stops at this date, if set
    pub stop_on: Option<chrono::NaiveDate>,
}

impl InstanceLogRule {
    pub fn matches(&self, selector: &str) -> bool {
        self.selector == "*" || self.selector == selector
    }
}

/// Log section
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub file: String,
    pub format: LogFormat,
    pub level: LogLevel,
    pub stdio_level: LogLevel,
    /// Template path still carrying `$SELECTOR$`
    pub instance_file: Option<String>,
    pub instance_format: LogFormat,
    pub instance_rules: Vec<InstanceLogRule>,
    /// Log admin HTTP request bodies at debug level
    pub http_request_body: bool,
}

impl LogSettings {
    /// Resolve the per-instance log path for a selector.
    pub fn instance_log_path(&self, selector: &str) -> Option<String> {
        self.instance_file
            .as_ref()
            .map(|t| t.replace("$SELECTOR$", selector))
    }
}

/// One configured TLS client certificate
#[derive(Debug, Clone)]
pub struct TlsClientCertificate {
    pub host: String,
    pub cert_file: String,
    pub key_file: String,
}

/// Keepalive emission settings
#[derive(Debug, Clone)]
pub struct KeepAliveSettings {
    pub enabled: bool,
    pub period: Duration,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            period: Duration::seconds(60),
        }
    }
}

/// An about-to-expire notification window with an optional silent sub-window.
/// Within the silent span the underlying refresh still runs but no push is raised.
#[derive(Debug, Clone)]
pub struct ExpiryWindow {
    pub threshold: Duration,
    pub silent: Duration,
}

/// Instance defaults (`<Instance>` section)
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub user_agent: String,
    pub max_age: Duration,
    pub premium_max_age: Duration,
    pub not_registered_max_age: Duration,
    pub keep_alive: KeepAliveSettings,
    pub about_to_expire_in: Option<ExpiryWindow>,
    pub about_to_expire_period: Option<ExpiryWindow>,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            user_agent: "Local Push".to_string(),
            max_age: Duration::days(365),
            premium_max_age: Duration::days(365),
            not_registered_max_age: Duration::minutes(3),
            keep_alive: KeepAliveSettings::default(),
            about_to_expire_in: None,
            about_to_expire_period: None,
        }
    }
}

/// Incoming call handling section
#[derive(Debug, Clone)]
pub struct IncomingCallSettings {
    pub not_answered_max_age: Duration,
}

impl Default for IncomingCallSettings {
    fn default() -> Self {
        Self {
            not_answered_max_age: Duration::minutes(2),
        }
    }
}

impl Settings {
    /// SIP bind address as host:port.
    pub fn sip_bind(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    /// Admin HTTP bind address as host:port.
    pub fn http_bind(&self) -> String {
        format!("{}:{}", self.http_server.bind_address, self.http_server.port)
    }

    /// Client certificate configured for a registrar host, if any.
    pub fn client_certificate_for(&self, host: &str) -> Option<&TlsClientCertificate> {
        self.tls_client_certificates
            .iter()
            .find(|c| c.host.eq_ignore_ascii_case(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
    }

    #[test]
    fn test_instance_log_rule_wildcard() {
        let rule = InstanceLogRule {
            selector: "*".to_string(),
            stop_on: None,
        };
        assert!(rule.matches("anything"));

        let rule = InstanceLogRule {
            selector: "abc".to_string(),
            stop_on: None,
        };
        assert!(rule.matches("abc"));
        assert!(!rule.matches("def"));
    }

    #[test]
    fn test_instance_log_path_substitution() {
        let log = LogSettings {
            file: "/tmp/sipis.log".to_string(),
            format: LogFormat::PlainText,
            level: LogLevel::Debug,
            stdio_level: LogLevel::Warning,
            instance_file: Some("/tmp/$SELECTOR$.log".to_string()),
            instance_format: LogFormat::PlainText,
            instance_rules: vec![],
            http_request_body: false,
        };
        assert_eq!(
            log.instance_log_path("acct1"),
            Some("/tmp/acct1.log".to_string())
        );
    }
}
