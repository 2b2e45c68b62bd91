//! Engine Lifecycle Integration Tests
//!
//! These drive the full stack over loopback UDP: a fake registrar answers
//! REGISTER transactions, a fake caller sends INVITEs, and a recording sink
//! captures the notifications raised toward the host.

use async_trait::async_trait;
use sipis::application::notify::Notification;
use sipis::config::{
    AdministratorSettings, DatabaseSettings, HttpServerSettings, IncomingCallSettings,
    InstanceSettings, LockSettings, LogFormat, LogLevel, LogSettings, ServerSettings, Settings,
};
use sipis::domain::account::RegistrationState;
use sipis::domain::filter::{FilterAction, FilterPredicate, FilterRule};
use sipis::infrastructure::persistence::{RecordCipher, Store};
use sipis::{Engine, EngineError, NotificationKind, NotificationSink, StopOption};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

const KEY: [u8; 16] = *b"0123456789abcdef";

struct Recorder {
    delivered: Mutex<Vec<Notification>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
        })
    }

    async fn count(&self) -> usize {
        self.delivered.lock().await.len()
    }
}

#[async_trait]
impl NotificationSink for Recorder {
    async fn notify(&self, notification: Notification) {
        self.delivered.lock().await.push(notification);
    }
}

fn settings(dir: &TempDir) -> Settings {
    Settings {
        server: ServerSettings {
            name: "test".to_string(),
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            public_address: None,
        },
        http_server: HttpServerSettings {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
        },
        lock: None,
        administrator: AdministratorSettings::default(),
        database: DatabaseSettings {
            open_string: dir.path().join("sipis.db").to_string_lossy().into_owned(),
        },
        log: LogSettings {
            file: dir.path().join("sipis.log").to_string_lossy().into_owned(),
            format: LogFormat::PlainText,
            level: LogLevel::Debug,
            stdio_level: LogLevel::Warning,
            instance_file: None,
            instance_format: LogFormat::PlainText,
            instance_rules: vec![],
            http_request_body: false,
        },
        tls_client_certificates: vec![],
        instance: InstanceSettings::default(),
        incoming_call: IncomingCallSettings::default(),
        message_filter: vec![],
    }
}

fn header_line(text: &str, name: &str) -> String {
    let prefix = format!("{}:", name.to_ascii_lowercase());
    text.lines()
        .find(|l| l.to_ascii_lowercase().starts_with(&prefix))
        .map(|l| l.to_string())
        .unwrap_or_default()
}

fn echo_headers(request: &str) -> String {
    format!(
        "{}\r\n{}\r\n{}\r\n{}\r\n{}\r\n",
        header_line(request, "Via"),
        header_line(request, "From"),
        header_line(request, "To"),
        header_line(request, "Call-ID"),
        header_line(request, "CSeq"),
    )
}

/// A registrar that answers every REGISTER with 200 and Expires: 600.
async fn start_registrar() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let text = String::from_utf8_lossy(&buf[..n]).to_string();
            if !text.starts_with("REGISTER") {
                continue;
            }
            let reply = format!(
                "SIP/2.0 200 OK\r\n{}Expires: 600\r\nContent-Length: 0\r\n\r\n",
                echo_headers(&text)
            );
            let _ = socket.send_to(reply.as_bytes(), from).await;
        }
    });
    addr
}

/// A registrar that challenges the first REGISTER and accepts the second
/// when it carries an Authorization header.
async fn start_challenging_registrar() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let text = String::from_utf8_lossy(&buf[..n]).to_string();
            if !text.starts_with("REGISTER") {
                continue;
            }
            let reply = if text.to_ascii_lowercase().contains("authorization:") {
                format!(
                    "SIP/2.0 200 OK\r\n{}Expires: 600\r\nContent-Length: 0\r\n\r\n",
                    echo_headers(&text)
                )
            } else {
                format!(
                    "SIP/2.0 401 Unauthorized\r\n{}WWW-Authenticate: Digest realm=\"test\", nonce=\"abc123\", algorithm=MD5\r\nContent-Length: 0\r\n\r\n",
                    echo_headers(&text)
                )
            };
            let _ = socket.send_to(reply.as_bytes(), from).await;
        }
    });
    addr
}

async fn wait_for_state(engine: &Engine, id: &str, state: RegistrationState) -> bool {
    for _ in 0..60 {
        let accounts = engine.accounts().await.unwrap();
        if accounts.iter().any(|a| a.id == id && a.state == state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn provisioning_blob(registrar: SocketAddr) -> String {
    format!(
        "username=alice&password=pw&domain={}&expires=600&selector=tok",
        registrar
    )
}

fn invite_for(registrar: SocketAddr, call_id: &str, branch: &str) -> String {
    format!(
        "INVITE sip:alice@{} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK{}\r\n\
         From: <sip:bob@remote.net>;tag=42\r\n\
         To: <sip:alice@{}>\r\n\
         Call-ID: {}\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n",
        registrar, branch, registrar, call_id
    )
}

fn message_for(
    registrar: SocketAddr,
    call_id: &str,
    branch: &str,
    content_type: &str,
    body: &str,
) -> String {
    format!(
        "MESSAGE sip:alice@{} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK{}\r\n\
         From: <sip:bob@remote.net>;tag=77\r\n\
         To: <sip:alice@{}>\r\n\
         Call-ID: {}\r\n\
         CSeq: 1 MESSAGE\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\r\n{}",
        registrar,
        branch,
        registrar,
        call_id,
        content_type,
        body.len(),
        body
    )
}

async fn send_and_receive(socket: &UdpSocket, packet: &str, to: SocketAddr) -> String {
    socket.send_to(packet.as_bytes(), to).await.unwrap();
    let mut buf = vec![0u8; 65535];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).to_string()
}

#[tokio::test]
async fn test_account_reaches_registered() {
    let dir = TempDir::new().unwrap();
    let registrar = start_registrar().await;
    let sink = Recorder::new();
    let engine = Engine::new(settings(&dir), sink);

    engine.start(Some(KEY)).await.unwrap();
    let account = engine
        .register_account(&provisioning_blob(registrar), false)
        .await
        .unwrap();
    assert_eq!(account.state, RegistrationState::Registering);

    let id = format!("alice@{}", registrar);
    assert!(wait_for_state(&engine, &id, RegistrationState::Registered).await);

    engine.stop(StopOption::ForgetInstances).await.unwrap();
}

#[tokio::test]
async fn test_digest_challenge_is_answered() {
    let dir = TempDir::new().unwrap();
    let registrar = start_challenging_registrar().await;
    let sink = Recorder::new();
    let engine = Engine::new(settings(&dir), sink);

    engine.start(None).await.unwrap();
    engine
        .register_account(&provisioning_blob(registrar), false)
        .await
        .unwrap();

    let id = format!("alice@{}", registrar);
    assert!(wait_for_state(&engine, &id, RegistrationState::Registered).await);

    engine.stop(StopOption::ForgetInstances).await.unwrap();
}

#[tokio::test]
async fn test_incoming_call_rings_and_notifies_once() {
    let dir = TempDir::new().unwrap();
    let registrar = start_registrar().await;
    let sink = Recorder::new();
    let engine = Engine::new(settings(&dir), sink.clone());

    engine.start(None).await.unwrap();
    engine
        .register_account(&provisioning_blob(registrar), false)
        .await
        .unwrap();
    let id = format!("alice@{}", registrar);
    assert!(wait_for_state(&engine, &id, RegistrationState::Registered).await);

    let sip_addr = engine.sip_address().await.unwrap();
    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let invite = invite_for(registrar, "call-1@caller", "ring1");
    caller.send_to(invite.as_bytes(), sip_addr).await.unwrap();

    // Expect 180 Ringing back at the caller
    let mut buf = vec![0u8; 65535];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), caller.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(reply.starts_with("SIP/2.0 180"), "got {}", reply);

    for _ in 0..40 {
        if sink.count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    {
        let delivered = sink.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].kind, NotificationKind::IncomingCall);
        assert_eq!(delivered[0].selector, "tok");
        assert_eq!(delivered[0].call_id.as_deref(), Some("call-1@caller"));
    }

    // A retransmitted INVITE is answered again but never notifies twice
    caller.send_to(invite.as_bytes(), sip_addr).await.unwrap();
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), caller.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("SIP/2.0 180"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.count().await, 1);

    engine.stop(StopOption::ForgetInstances).await.unwrap();
}

#[tokio::test]
async fn test_unanswered_call_notifies_exactly_once() {
    let dir = TempDir::new().unwrap();
    let mut config = settings(&dir);
    // Any ringing time at all counts as unanswered
    config.incoming_call.not_answered_max_age = chrono::Duration::zero();
    let registrar = start_registrar().await;
    let sink = Recorder::new();
    let engine = Engine::new(config, sink.clone());

    engine.start(None).await.unwrap();
    engine
        .register_account(&provisioning_blob(registrar), false)
        .await
        .unwrap();
    let id = format!("alice@{}", registrar);
    assert!(wait_for_state(&engine, &id, RegistrationState::Registered).await);

    let sip_addr = engine.sip_address().await.unwrap();
    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    caller
        .send_to(invite_for(registrar, "call-3@caller", "miss1").as_bytes(), sip_addr)
        .await
        .unwrap();
    for _ in 0..40 {
        if sink.count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(sink.count().await, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.timer_tick().await.unwrap();
    for _ in 0..40 {
        if sink.count().await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    {
        let delivered = sink.delivered.lock().await;
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].kind, NotificationKind::NotAnswered);
        assert_eq!(delivered[1].call_id.as_deref(), Some("call-3@caller"));
    }

    // The dialog is gone; further ticks raise nothing new
    engine.timer_tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.count().await, 2);

    engine.stop(StopOption::ForgetInstances).await.unwrap();
}

#[tokio::test]
async fn test_incoming_messages_follow_the_filter_decisions() {
    let dir = TempDir::new().unwrap();
    let mut config = settings(&dir);
    config.message_filter = vec![
        FilterRule {
            enabled: true,
            predicates: vec![FilterPredicate::Equal {
                header: "Content-Type".to_string(),
                value: "application/im-iscomposing+xml".to_string(),
            }],
            action: FilterAction::AcceptAndDrop,
        },
        FilterRule {
            enabled: true,
            predicates: vec![FilterPredicate::UintGt {
                header: "Content-Length".to_string(),
                threshold: 1000,
            }],
            action: FilterAction::Reject {
                code: 413,
                phrase: "Message Too Large".to_string(),
            },
        },
    ];
    let registrar = start_registrar().await;
    let sink = Recorder::new();
    let engine = Engine::new(config.clone(), sink.clone());

    engine.start(None).await.unwrap();
    engine
        .register_account(&provisioning_blob(registrar), false)
        .await
        .unwrap();
    let id = format!("alice@{}", registrar);
    assert!(wait_for_state(&engine, &id, RegistrationState::Registered).await);

    let sip_addr = engine.sip_address().await.unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Oversized message: refused with the configured code and phrase
    let oversized = message_for(
        registrar,
        "msg-big@sender",
        "flt1",
        "text/plain",
        &"x".repeat(2000),
    );
    let reply = send_and_receive(&sender, &oversized, sip_addr).await;
    assert!(
        reply.starts_with("SIP/2.0 413 Message Too Large"),
        "got {}",
        reply
    );

    // Typing indicator: answered 200 but never pushed
    let composing = message_for(
        registrar,
        "msg-typing@sender",
        "flt2",
        "application/im-iscomposing+xml",
        "",
    );
    let reply = send_and_receive(&sender, &composing, sip_addr).await;
    assert!(reply.starts_with("SIP/2.0 200"), "got {}", reply);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.count().await, 0);

    // Ordinary message: answered 200 and raises exactly one notification
    let plain = message_for(registrar, "msg-hi@sender", "flt3", "text/plain", "hi");
    let reply = send_and_receive(&sender, &plain, sip_addr).await;
    assert!(reply.starts_with("SIP/2.0 200"), "got {}", reply);

    for _ in 0..40 {
        if sink.count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    {
        let delivered = sink.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].kind, NotificationKind::IncomingMessage);
        assert_eq!(delivered[0].call_id.as_deref(), Some("msg-hi@sender"));
    }

    // None of the messages allocated dialog state
    engine.stop(StopOption::RememberInstances).await.unwrap();
    let store = Store::open(&config.database.open_string, None).await.unwrap();
    assert!(store.take_dialogs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_engine_from_settings_document() {
    let dir = TempDir::new().unwrap();
    let document = r#"<Sipis>
             <Server Address="127.0.0.1" Port="0"/>
             <HttpServer Address="127.0.0.1" Port="0"/>
             <Database OpenString="{BASEPATH}/sipisdb.sqlite"/>
             <Log FileName="{BASEPATH}/sipis.log" Level="Warning" Stdio="Warning"/>
           </Sipis>"#;
    let engine = Engine::from_xml(
        document,
        &dir.path().to_string_lossy(),
        Recorder::new(),
    )
    .unwrap();

    engine.start(None).await.unwrap();
    assert!(engine.is_running().await);
    assert!(dir.path().join("sipisdb.sqlite").exists());
    engine.stop(StopOption::ForgetInstances).await.unwrap();
}

#[tokio::test]
async fn test_accounts_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = settings(&dir);
    let sink = Recorder::new();

    // Registrar never answers; the account stays in Registering
    let unreachable: SocketAddr = "127.0.0.1:9".parse().unwrap();

    let engine = Engine::new(config.clone(), sink.clone());
    engine.start(Some(KEY)).await.unwrap();
    engine
        .register_account(&provisioning_blob(unreachable), false)
        .await
        .unwrap();
    assert_eq!(engine.accounts().await.unwrap().len(), 1);
    engine.stop(StopOption::ForgetInstances).await.unwrap();

    let engine = Engine::new(config, sink);
    engine.start(Some(KEY)).await.unwrap();
    let accounts = engine.accounts().await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].id, format!("alice@{}", unreachable));
    engine.stop(StopOption::ForgetInstances).await.unwrap();
}

#[tokio::test]
async fn test_stop_remember_snapshots_dialogs() {
    let dir = TempDir::new().unwrap();
    let config = settings(&dir);
    let registrar = start_registrar().await;
    let sink = Recorder::new();
    let engine = Engine::new(config.clone(), sink.clone());

    engine.start(None).await.unwrap();
    engine
        .register_account(&provisioning_blob(registrar), false)
        .await
        .unwrap();
    let id = format!("alice@{}", registrar);
    assert!(wait_for_state(&engine, &id, RegistrationState::Registered).await);

    let sip_addr = engine.sip_address().await.unwrap();
    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    caller
        .send_to(invite_for(registrar, "call-2@caller", "snap1").as_bytes(), sip_addr)
        .await
        .unwrap();
    for _ in 0..40 {
        if sink.count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    engine.stop(StopOption::RememberInstances).await.unwrap();

    let store = Store::open(&config.database.open_string, None).await.unwrap();
    let dialogs = store.take_dialogs().await.unwrap();
    assert_eq!(dialogs.len(), 1);
    assert_eq!(dialogs[0].call_id, "call-2@caller");
}

#[tokio::test]
async fn test_calls_require_running_engine() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(settings(&dir), Recorder::new());

    assert!(matches!(
        engine.timer_tick().await.unwrap_err(),
        EngineError::NotRunning
    ));
    assert!(matches!(
        engine.register_account("username=a&domain=d", false).await.unwrap_err(),
        EngineError::NotRunning
    ));
    assert!(matches!(
        engine.accounts().await.unwrap_err(),
        EngineError::NotRunning
    ));

    // Stopping a stopped engine is a no-op, not an error
    engine.stop(StopOption::ForgetInstances).await.unwrap();
}

#[tokio::test]
async fn test_failed_start_removes_pid_file() {
    let dir = TempDir::new().unwrap();
    let mut config = settings(&dir);
    let pid_file = dir.path().join("sipis.pid").to_string_lossy().into_owned();
    config.lock = Some(LockSettings {
        pid_file: pid_file.clone(),
    });
    // The store path runs through a regular file, so opening it fails
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, b"").unwrap();
    config.database.open_string = blocked.join("sipis.db").to_string_lossy().into_owned();

    let engine = Engine::new(config, Recorder::new());
    assert!(engine.start(None).await.is_err());
    assert!(!engine.is_running().await);
    assert!(!std::path::Path::new(&pid_file).exists());
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(settings(&dir), Recorder::new());

    engine.start(None).await.unwrap();
    engine.start(None).await.unwrap();
    assert!(engine.is_running().await);

    engine.stop(StopOption::ForgetInstances).await.unwrap();
    engine.stop(StopOption::ForgetInstances).await.unwrap();
    assert!(!engine.is_running().await);
}

#[tokio::test]
async fn test_encrypted_provisioning_blob() {
    let dir = TempDir::new().unwrap();
    let registrar = start_registrar().await;
    let engine = Engine::new(settings(&dir), Recorder::new());

    engine.start(Some(KEY)).await.unwrap();

    let cipher = RecordCipher::new(&KEY);
    let sealed = cipher
        .seal_base64(provisioning_blob(registrar).as_bytes())
        .unwrap();
    let account = engine.register_account(&sealed, true).await.unwrap();
    assert_eq!(account.username, "alice");

    // Garbage ciphertext is a decryption error, not garbled provisioning
    let err = engine
        .register_account("bm90LXNlYWxlZA==", true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Decryption(_)));

    engine.stop(StopOption::ForgetInstances).await.unwrap();
}

#[tokio::test]
async fn test_encrypted_blob_requires_key() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(settings(&dir), Recorder::new());

    engine.start(None).await.unwrap();
    let err = engine.register_account("whatever", true).await.unwrap_err();
    assert!(matches!(err, EngineError::Decryption(_)));
    engine.stop(StopOption::ForgetInstances).await.unwrap();
}
