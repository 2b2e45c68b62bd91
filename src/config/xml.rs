//! Settings document parser
//!
//! Parses the XML-form settings document supplied by the host at `start` into
//! the typed [`Settings`](super::Settings) tree. Required sections are `Server`,
//! `Database` and `Log`; anything malformed fails with a configuration error
//! surfaced through the start callback.

use super::{
    AdministratorSettings, DatabaseSettings, ExpiryWindow, HttpServerSettings,
    IncomingCallSettings, InstanceLogRule, InstanceSettings, KeepAliveSettings, LockSettings,
    LogFormat, LogLevel, LogSettings, ServerSettings, Settings, TlsClientCertificate,
};
use crate::domain::filter::{FilterAction, FilterPredicate, FilterRule};
use crate::domain::shared::{EngineError, Result};
use chrono::{Duration, NaiveDate};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

/// Parse and validate a settings document, substituting the `{BASEPATH}` token
/// in every path attribute. `$SELECTOR$` is kept as a per-instance template.
pub fn load_settings(document: &str, base_path: &str) -> Result<Settings> {
    let mut reader = Reader::from_str(document);
    let mut stack: Vec<String> = Vec::new();
    let mut builder = SettingsBuilder::new(base_path);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = element_name(&e);
                builder.enter(&stack, &name, collect_attributes(&e)?)?;
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = element_name(&e);
                builder.enter(&stack, &name, collect_attributes(&e)?)?;
                builder.leave(&stack, &name)?;
            }
            Ok(Event::End(_)) => {
                if let Some(name) = stack.pop() {
                    builder.leave(&stack, &name)?;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(EngineError::Config(format!(
                    "malformed settings document: {}",
                    e
                )))
            }
        }
    }

    builder.finish()
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn collect_attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr
            .map_err(|e| EngineError::Config(format!("malformed attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| EngineError::Config(format!("malformed attribute value: {}", e)))?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

/// Accumulates sections while walking the document.
struct SettingsBuilder {
    base_path: String,
    server: Option<ServerSettings>,
    http_server: Option<HttpServerSettings>,
    lock: Option<LockSettings>,
    administrator: Option<AdministratorSettings>,
    database: Option<DatabaseSettings>,
    log: Option<LogSettings>,
    tls_client_certificates: Vec<TlsClientCertificate>,
    instance: InstanceSettings,
    incoming_call: IncomingCallSettings,
    message_filter: Vec<FilterRule>,
    // in-flight filter entry
    entry_enabled: bool,
    entry_action: Option<String>,
    entry_predicates: Vec<FilterPredicate>,
    entry_reject: Option<(u16, String)>,
    // in-flight log instance rule
    log_rule: Option<InstanceLogRule>,
    // which about-to-expire window a <Silent> applies to
    silent_target: Option<SilentTarget>,
}

#[derive(Clone, Copy)]
enum SilentTarget {
    In,
    Period,
}

impl SettingsBuilder {
    fn new(base_path: &str) -> Self {
        Self {
            base_path: base_path.to_string(),
            server: None,
            http_server: None,
            lock: None,
            administrator: None,
            database: None,
            log: None,
            tls_client_certificates: Vec::new(),
            instance: InstanceSettings::default(),
            incoming_call: IncomingCallSettings::default(),
            message_filter: Vec::new(),
            entry_enabled: true,
            entry_action: None,
            entry_predicates: Vec::new(),
            entry_reject: None,
            log_rule: None,
            silent_target: None,
        }
    }

    fn enter(
        &mut self,
        stack: &[String],
        name: &str,
        attrs: HashMap<String, String>,
    ) -> Result<()> {
        let parent = stack.last().map(|s| s.as_str()).unwrap_or("");

        match (parent, name) {
            ("", "Sipis") => {}
            ("Sipis", "Server") => {
                self.server = Some(ServerSettings {
                    name: get(&attrs, "Name").unwrap_or_else(|| "sipis".to_string()),
                    bind_address: require(&attrs, "Server", "Address")?,
                    port: parse_num(&attrs, "Server", "Port")?,
                    public_address: get(&attrs, "PublicAddress"),
                });
            }
            ("Sipis", "HttpServer") => {
                self.http_server = Some(HttpServerSettings {
                    bind_address: require(&attrs, "HttpServer", "Address")?,
                    port: parse_num(&attrs, "HttpServer", "Port")?,
                });
            }
            ("Sipis", "Lock") => {
                self.lock = Some(LockSettings {
                    pid_file: self.resolve_path(&require(&attrs, "Lock", "FileName")?)?,
                });
            }
            ("Sipis", "Administrator") => {
                self.administrator = Some(AdministratorSettings {
                    username: require(&attrs, "Administrator", "UserName")?,
                    password: require(&attrs, "Administrator", "Password")?,
                });
            }
            ("Sipis", "Database") => {
                self.database = Some(DatabaseSettings {
                    open_string: self.resolve_path(&require(&attrs, "Database", "OpenString")?)?,
                });
            }
            ("Sipis", "Log") => {
                let instance_file = match get(&attrs, "InstanceFileName") {
                    Some(f) => Some(self.resolve_template_path(&f)?),
                    None => None,
                };
                self.log = Some(LogSettings {
                    file: self.resolve_path(&require(&attrs, "Log", "FileName")?)?,
                    format: parse_format(get(&attrs, "Format"))?,
                    level: parse_level(get(&attrs, "Level"), LogLevel::Info)?,
                    stdio_level: parse_level(get(&attrs, "Stdio"), LogLevel::Warning)?,
                    instance_file,
                    instance_format: parse_format(get(&attrs, "InstanceFormat"))?,
                    instance_rules: Vec::new(),
                    http_request_body: false,
                });
            }
            ("Log", "Instance") => {
                self.log_rule = Some(InstanceLogRule {
                    selector: get(&attrs, "Selector").unwrap_or_else(|| "*".to_string()),
                    stop_on: None,
                });
            }
            ("Instance", "StopOn") if stack.len() >= 2 && stack[stack.len() - 2] == "Log" => {
                let year: i32 = parse_num(&attrs, "StopOn", "Year")?;
                let month: u32 = parse_num(&attrs, "StopOn", "Month")?;
                let day: u32 = parse_num(&attrs, "StopOn", "Day")?;
                let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
                    EngineError::Config(format!("invalid StopOn date {}-{}-{}", year, month, day))
                })?;
                if let Some(rule) = self.log_rule.as_mut() {
                    rule.stop_on = Some(date);
                }
            }
            ("Log", "Http") => {
                if let Some(log) = self.log.as_mut() {
                    log.http_request_body = parse_yes_no(get(&attrs, "RequestBody"), false);
                }
            }
            ("Sipis", "TlsClientCertificates") => {}
            ("TlsClientCertificates", "Certificate") => {
                let host = get(&attrs, "Host").unwrap_or_default();
                if !host.is_empty() {
                    self.tls_client_certificates.push(TlsClientCertificate {
                        host,
                        cert_file: self
                            .resolve_path(&require(&attrs, "Certificate", "FileName")?)?,
                        key_file: self.resolve_path(&require(
                            &attrs,
                            "Certificate",
                            "RsaPrivateKeyFileName",
                        )?)?,
                    });
                }
            }
            ("Sipis", "Instance") => {
                if let Some(ua) = get(&attrs, "UserAgent") {
                    self.instance.user_agent = ua;
                }
            }
            ("Instance", "MaxAge") => {
                self.instance.max_age = parse_duration(&attrs);
            }
            ("Instance", "PremiumMaxAge") => {
                self.instance.premium_max_age = parse_duration(&attrs);
            }
            ("Instance", "NotRegisteredMaxAge") => {
                self.instance.not_registered_max_age = parse_duration(&attrs);
            }
            ("Instance", "KeepAlivePackets") => {
                self.instance.keep_alive = KeepAliveSettings {
                    enabled: parse_yes_no(get(&attrs, "Enabled"), true),
                    ..self.instance.keep_alive.clone()
                };
            }
            ("KeepAlivePackets", "Period") => {
                self.instance.keep_alive.period = parse_duration(&attrs);
            }
            ("Instance", "AboutToExpireIn") => {
                self.instance.about_to_expire_in = Some(ExpiryWindow {
                    threshold: parse_duration(&attrs),
                    silent: Duration::zero(),
                });
                self.silent_target = Some(SilentTarget::In);
            }
            ("Instance", "AboutToExpirePeriod") => {
                self.instance.about_to_expire_period = Some(ExpiryWindow {
                    threshold: parse_duration(&attrs),
                    silent: Duration::zero(),
                });
                self.silent_target = Some(SilentTarget::Period);
            }
            ("AboutToExpireIn", "Silent") | ("AboutToExpirePeriod", "Silent") => {
                let silent = parse_duration(&attrs);
                match self.silent_target {
                    Some(SilentTarget::In) => {
                        if let Some(w) = self.instance.about_to_expire_in.as_mut() {
                            w.silent = silent;
                        }
                    }
                    Some(SilentTarget::Period) => {
                        if let Some(w) = self.instance.about_to_expire_period.as_mut() {
                            w.silent = silent;
                        }
                    }
                    None => {}
                }
            }
            ("Sipis", "IncomingCall") => {}
            ("IncomingCall", "NotAnsweredMaxAge") => {
                self.incoming_call.not_answered_max_age = parse_duration(&attrs);
            }
            ("Sipis", "IncomingTextMessage") => {}
            ("IncomingTextMessage", "Filter") => {}
            ("Filter", "Entry") => {
                self.entry_enabled = parse_yes_no(get(&attrs, "Enabled"), true);
                self.entry_action = Some(require(&attrs, "Entry", "Action")?);
                self.entry_predicates = Vec::new();
                self.entry_reject = None;
            }
            ("Entry", "Header") => {
                let header = require(&attrs, "Header", "Name")?;
                if let Some(value) = get(&attrs, "Equal") {
                    self.entry_predicates
                        .push(FilterPredicate::Equal { header, value });
                } else if let Some(value) = get(&attrs, "Contains") {
                    self.entry_predicates
                        .push(FilterPredicate::Contains { header, value });
                } else if let Some(value) = get(&attrs, "UintGt") {
                    let threshold = value.parse::<u64>().map_err(|_| {
                        EngineError::Config(format!("UintGt is not a number: {:?}", value))
                    })?;
                    self.entry_predicates
                        .push(FilterPredicate::UintGt { header, threshold });
                } else {
                    return Err(EngineError::Config(format!(
                        "Header predicate for {:?} needs Equal, Contains or UintGt",
                        header
                    )));
                }
            }
            ("Entry", "RejectWith") => {
                let code: u16 = parse_num(&attrs, "RejectWith", "Code")?;
                let phrase = get(&attrs, "Phrase").unwrap_or_else(|| "Forbidden".to_string());
                self.entry_reject = Some((code, phrase));
            }
            _ => {
                // Unknown elements are tolerated so newer documents stay loadable
            }
        }

        Ok(())
    }

    fn leave(&mut self, stack: &[String], name: &str) -> Result<()> {
        let parent = stack.last().map(|s| s.as_str()).unwrap_or("");
        match (parent, name) {
            ("Log", "Instance") => {
                if let (Some(log), Some(rule)) = (self.log.as_mut(), self.log_rule.take()) {
                    log.instance_rules.push(rule);
                }
            }
            ("Instance", "AboutToExpireIn") | ("Instance", "AboutToExpirePeriod") => {
                self.silent_target = None;
            }
            ("Filter", "Entry") => {
                let action = match self.entry_action.take().as_deref() {
                    Some("AcceptAndDrop") => FilterAction::AcceptAndDrop,
                    Some("AcceptAndDoNotPush") => FilterAction::AcceptAndDoNotPush,
                    Some("Reject") => {
                        let (code, phrase) = self
                            .entry_reject
                            .take()
                            .unwrap_or((403, "Forbidden".to_string()));
                        FilterAction::Reject { code, phrase }
                    }
                    Some(other) => {
                        return Err(EngineError::Config(format!(
                            "unknown filter action {:?}",
                            other
                        )))
                    }
                    None => return Ok(()),
                };
                self.message_filter.push(FilterRule {
                    enabled: self.entry_enabled,
                    predicates: std::mem::take(&mut self.entry_predicates),
                    action,
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<Settings> {
        let server = self
            .server
            .ok_or_else(|| EngineError::Config("missing required section Server".to_string()))?;
        let database = self
            .database
            .ok_or_else(|| EngineError::Config("missing required section Database".to_string()))?;
        let log = self
            .log
            .ok_or_else(|| EngineError::Config("missing required section Log".to_string()))?;

        Ok(Settings {
            server,
            http_server: self.http_server.unwrap_or_default(),
            lock: self.lock,
            administrator: self.administrator.unwrap_or_default(),
            database,
            log,
            tls_client_certificates: self.tls_client_certificates,
            instance: self.instance,
            incoming_call: self.incoming_call,
            message_filter: self.message_filter,
        })
    }

    /// Substitute `{BASEPATH}` and reject any other brace token.
    fn resolve_path(&self, raw: &str) -> Result<String> {
        let resolved = raw.replace("{BASEPATH}", &self.base_path);
        if resolved.contains('{') || resolved.contains("$SELECTOR$") {
            return Err(EngineError::Config(format!(
                "unresolvable token in path {:?}",
                raw
            )));
        }
        Ok(resolved)
    }

    /// Like `resolve_path` but `$SELECTOR$` may remain as a template.
    fn resolve_template_path(&self, raw: &str) -> Result<String> {
        let resolved = raw.replace("{BASEPATH}", &self.base_path);
        if resolved.contains('{') {
            return Err(EngineError::Config(format!(
                "unresolvable token in path {:?}",
                raw
            )));
        }
        Ok(resolved)
    }
}

fn get(attrs: &HashMap<String, String>, key: &str) -> Option<String> {
    attrs.get(key).cloned()
}

fn require(attrs: &HashMap<String, String>, element: &str, key: &str) -> Result<String> {
    attrs.get(key).cloned().ok_or_else(|| {
        EngineError::Config(format!("{} is missing required attribute {}", element, key))
    })
}

fn parse_num<T: std::str::FromStr>(
    attrs: &HashMap<String, String>,
    element: &str,
    key: &str,
) -> Result<T> {
    let raw = require(attrs, element, key)?;
    raw.parse::<T>().map_err(|_| {
        EngineError::Config(format!("{} attribute {} is not a number: {:?}", element, key, raw))
    })
}

/// Compose a duration from Days/Hours/Minutes/Seconds attributes.
fn parse_duration(attrs: &HashMap<String, String>) -> Duration {
    let component = |key: &str| -> i64 {
        attrs
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
    };
    Duration::days(component("Days"))
        + Duration::hours(component("Hours"))
        + Duration::minutes(component("Minutes"))
        + Duration::seconds(component("Seconds"))
}

fn parse_yes_no(value: Option<String>, default: bool) -> bool {
    match value.as_deref() {
        Some(v) => v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn parse_format(value: Option<String>) -> Result<LogFormat> {
    match value.as_deref() {
        Some("PlainText") | None => Ok(LogFormat::PlainText),
        Some("Json") => Ok(LogFormat::Json),
        Some(other) => Err(EngineError::Config(format!(
            "unknown log format {:?}",
            other
        ))),
    }
}

fn parse_level(value: Option<String>, default: LogLevel) -> Result<LogLevel> {
    match value.as_deref() {
        None => Ok(default),
        Some("Error") => Ok(LogLevel::Error),
        Some("Warning") => Ok(LogLevel::Warning),
        Some("Info") => Ok(LogLevel::Info),
        Some("Debug") => Ok(LogLevel::Debug),
        Some(other) => Err(EngineError::Config(format!("unknown log level {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::filter::FilterAction;

    const SETTINGS: &str = r#"
        <Sipis>
          <Server Name="local sipis" Address="0.0.0.0" Port="4998" PublicAddress="203.0.113.7"/>
          <HttpServer Address="0.0.0.0" Port="5000"/>
          <Lock FileName="{BASEPATH}/sipis.pid"/>
          <Administrator UserName="admin" Password="admin"/>
          <Database OpenString="{BASEPATH}/sipisdb.sqlite"/>
          <Log FileName="{BASEPATH}/sipis.log" Format="PlainText" InstanceFileName="{BASEPATH}/$SELECTOR$.log" Level="Debug" Stdio="Warning" InstanceFormat="PlainText">
            <Instance Selector="*">
              <StopOn Year="2100" Month="1" Day="1"/>
            </Instance>
            <Http RequestBody="Yes" />
          </Log>
          <TlsClientCertificates>
          </TlsClientCertificates>
          <Instance UserAgent="Local Push">
            <MaxAge Days="365"/>
            <PremiumMaxAge Days="365"/>
            <NotRegisteredMaxAge Minutes="3"/>
            <KeepAlivePackets Enabled="Yes">
               <Period Seconds="60"/>
            </KeepAlivePackets>
            <AboutToExpireIn Minutes="4">
              <Silent Minutes="1"/>
            </AboutToExpireIn>
            <AboutToExpirePeriod Minutes="2">
              <Silent Minutes="2"/>
            </AboutToExpirePeriod>
          </Instance>
          <IncomingCall>
            <NotAnsweredMaxAge Days="0" Hours="0" Minutes="2" Seconds="0"/>
          </IncomingCall>
          <IncomingTextMessage>
            <Filter>
              <Entry Action="AcceptAndDrop" Enabled="Yes">
                <Header Name="Content-Type" Equal="application/im-iscomposing+xml" />
              </Entry>
              <Entry Action="AcceptAndDoNotPush" Enabled="Yes">
                <Header Name="Content-Type" Contains=";imdn" />
              </Entry>
              <Entry Action="Reject" Enabled="Yes">
                <Header Name="Content-Length" UintGt="4194304" />
                <RejectWith Code="413" Phrase="Request Entity Too Large" />
              </Entry>
            </Filter>
          </IncomingTextMessage>
        </Sipis>
    "#;

    #[test]
    fn test_load_full_document() {
        let settings = load_settings(SETTINGS, "/var/shared").unwrap();

        assert_eq!(settings.server.port, 4998);
        assert_eq!(settings.server.public_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(settings.http_server.port, 5000);
        assert_eq!(
            settings.database.open_string,
            "/var/shared/sipisdb.sqlite"
        );
        assert_eq!(settings.log.file, "/var/shared/sipis.log");
        assert_eq!(settings.log.level, LogLevel::Debug);
        assert_eq!(settings.log.stdio_level, LogLevel::Warning);
        assert!(settings.log.http_request_body);
        assert_eq!(settings.log.instance_rules.len(), 1);
        assert_eq!(
            settings.lock.as_ref().unwrap().pid_file,
            "/var/shared/sipis.pid"
        );

        assert_eq!(settings.instance.max_age, Duration::days(365));
        assert_eq!(
            settings.instance.not_registered_max_age,
            Duration::minutes(3)
        );
        assert!(settings.instance.keep_alive.enabled);
        assert_eq!(settings.instance.keep_alive.period, Duration::seconds(60));

        let in_window = settings.instance.about_to_expire_in.as_ref().unwrap();
        assert_eq!(in_window.threshold, Duration::minutes(4));
        assert_eq!(in_window.silent, Duration::minutes(1));
        let period_window = settings.instance.about_to_expire_period.as_ref().unwrap();
        assert_eq!(period_window.threshold, Duration::minutes(2));
        assert_eq!(period_window.silent, Duration::minutes(2));

        assert_eq!(
            settings.incoming_call.not_answered_max_age,
            Duration::minutes(2)
        );

        assert_eq!(settings.message_filter.len(), 3);
        assert!(matches!(
            settings.message_filter[2].action,
            FilterAction::Reject { code: 413, .. }
        ));
    }

    #[test]
    fn test_missing_server_section_fails() {
        let doc = r#"
            <Sipis>
              <Database OpenString="/tmp/db.sqlite"/>
              <Log FileName="/tmp/sipis.log"/>
            </Sipis>
        "#;
        let err = load_settings(doc, "/tmp").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("Server"));
    }

    #[test]
    fn test_missing_required_attribute_fails() {
        let doc = r#"
            <Sipis>
              <Server Address="0.0.0.0"/>
              <Database OpenString="/tmp/db.sqlite"/>
              <Log FileName="/tmp/sipis.log"/>
            </Sipis>
        "#;
        let err = load_settings(doc, "/tmp").unwrap_err();
        assert!(err.to_string().contains("Port"));
    }

    #[test]
    fn test_unresolvable_token_fails() {
        let doc = r#"
            <Sipis>
              <Server Address="0.0.0.0" Port="4998"/>
              <Database OpenString="{SHAREDPATH}/db.sqlite"/>
              <Log FileName="/tmp/sipis.log"/>
            </Sipis>
        "#;
        let err = load_settings(doc, "/tmp").unwrap_err();
        assert!(err.to_string().contains("unresolvable token"));
    }

    #[test]
    fn test_malformed_document_fails() {
        let err = load_settings("<Sipis><Server", "/tmp").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_minimal_document_gets_defaults() {
        let doc = r#"
            <Sipis>
              <Server Address="0.0.0.0" Port="4998"/>
              <Database OpenString="{BASEPATH}/db.sqlite"/>
              <Log FileName="{BASEPATH}/sipis.log"/>
            </Sipis>
        "#;
        let settings = load_settings(doc, "/tmp").unwrap();
        assert_eq!(settings.http_server.port, 5000);
        assert_eq!(settings.administrator.username, "admin");
        assert_eq!(settings.log.level, LogLevel::Info);
        assert!(settings.message_filter.is_empty());
        assert!(settings.instance.about_to_expire_in.is_none());
    }
}
