//! Engine lifecycle driven by the host extension
//!
//! The host constructs one `Engine` per process, starts it when signaling
//! should run, feeds it timer ticks, and stops it when the extension is about
//! to be suspended. All durable state lives in the store; the in-memory
//! dialog table survives a stop only under `RememberInstances`.

use crate::application::notify::{Dispatcher, NotificationSink};
use crate::config::{LogFormat, LogSettings, Settings};
use crate::domain::account::{Account, ProvisioningData};
use crate::domain::shared::{EngineError, Result};
use crate::infrastructure::persistence::{RecordCipher, Store};
use crate::infrastructure::protocols::sip::engine::SipEngineConfig;
use crate::infrastructure::protocols::sip::transport::TransportLayer;
use crate::infrastructure::protocols::sip::SignalingEngine;
use crate::interface::api::{build_router, ApiState};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Duplicate notifications inside this window are suppressed.
fn notification_dedup_window() -> Duration {
    Duration::seconds(2)
}

/// What to do with in-flight dialogs on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOption {
    /// Discard the dialog table; a restart begins with no in-flight calls
    ForgetInstances,
    /// Snapshot the dialog table for resumption by the next start
    RememberInstances,
}

struct Running {
    signaling: Arc<SignalingEngine>,
    store: Arc<Store>,
    sip_address: std::net::SocketAddr,
    cipher: Option<RecordCipher>,
    inbound_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
    http_task: JoinHandle<()>,
    http_shutdown: oneshot::Sender<()>,
    pid_file: Option<String>,
}

/// The engine facade handed to the host.
pub struct Engine {
    settings: Settings,
    sink: Arc<dyn NotificationSink>,
    running: Mutex<Option<Running>>,
}

impl Engine {
    pub fn new(settings: Settings, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            settings,
            sink,
            running: Mutex::new(None),
        }
    }

    /// Construct from the host's settings document, installing the logging
    /// subscriber the document asks for.
    pub fn from_xml(
        document: &str,
        base_path: &str,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let settings = crate::config::load_settings(document, base_path)?;
        init_logging(&settings.log);
        Ok(Self::new(settings, sink))
    }

    /// Bring the engine up: open the store, bind the listeners, resume
    /// persisted accounts and any remembered dialogs, start the admin channel.
    /// Idempotent; a second start while running is a no-op.
    pub async fn start(&self, store_key: Option<[u8; 16]>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("start called while already running");
            return Ok(());
        }

        let pid_file = match &self.settings.lock {
            Some(lock) => {
                // A leftover pid file from a killed process is overwritten
                if std::path::Path::new(&lock.pid_file).exists() {
                    warn!(pid_file = %lock.pid_file, "overwriting stale pid file");
                }
                std::fs::write(&lock.pid_file, std::process::id().to_string())?;
                Some(lock.pid_file.clone())
            }
            None => None,
        };

        match self.bring_up(store_key).await {
            Ok(mut up) => {
                up.pid_file = pid_file;
                *running = Some(up);
                info!("engine started");
                Ok(())
            }
            Err(e) => {
                // A failed start must not keep holding the lock
                if let Some(pid_file) = pid_file {
                    let _ = std::fs::remove_file(&pid_file);
                }
                Err(e)
            }
        }
    }

    async fn bring_up(&self, store_key: Option<[u8; 16]>) -> Result<Running> {
        let store = Arc::new(Store::open(&self.settings.database.open_string, store_key).await?);
        let cipher = store_key.map(|k| RecordCipher::new(&k));

        let (inbound_tx, mut inbound_rx) = mpsc::channel(256);
        let mut transport =
            TransportLayer::new(inbound_tx, self.settings.tls_client_certificates.clone());
        let local = transport
            .bind(&self.settings.sip_bind())
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        let transport = Arc::new(transport);

        // Contact advertises the public address when one is configured
        let contact_host = match &self.settings.server.public_address {
            Some(addr) if addr.contains(':') => addr.clone(),
            Some(addr) => format!("{}:{}", addr, local.port()),
            None => local.to_string(),
        };

        let (event_tx, mut event_rx) = mpsc::channel(256);
        let signaling = Arc::new(SignalingEngine::new(
            SipEngineConfig {
                via_host: local.to_string(),
                contact_host,
                instance: self.settings.instance.clone(),
                incoming_call: self.settings.incoming_call.clone(),
                filters: self.settings.message_filter.clone(),
            },
            store.clone(),
            transport,
            event_tx,
        ));

        let remembered = store.take_dialogs().await?;
        if !remembered.is_empty() {
            info!(count = remembered.len(), "resuming remembered dialogs");
            signaling.restore_dialogs(remembered).await;
        }
        signaling.load_persisted().await?;

        let inbound_engine = signaling.clone();
        let inbound_task = tokio::spawn(async move {
            while let Some(incoming) = inbound_rx.recv().await {
                if let Err(e) = inbound_engine.handle_incoming(incoming).await {
                    warn!(error = %e, "inbound message handling failed");
                }
            }
        });

        let dispatcher = Dispatcher::new(self.sink.clone(), notification_dedup_window());
        let event_task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                dispatcher.dispatch(event).await;
            }
        });

        let router = build_router(ApiState {
            signaling: signaling.clone(),
            administrator: self.settings.administrator.clone(),
            cipher: cipher.clone(),
            log_request_body: self.settings.log.http_request_body,
        });
        let listener = tokio::net::TcpListener::bind(&self.settings.http_bind()).await?;
        info!(addr = %listener.local_addr()?, "admin HTTP listening");
        let (http_shutdown, shutdown_rx) = oneshot::channel::<()>();
        let http_task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "admin HTTP server failed");
            }
        });

        Ok(Running {
            signaling,
            store,
            sip_address: local,
            cipher,
            inbound_task,
            event_task,
            http_task,
            http_shutdown,
            pid_file: None,
        })
    }

    /// Provision an account from a posted blob. With `encrypted`, the blob is
    /// sealed (base64) under the store key and opened before parsing.
    pub async fn register_account(&self, post_data: &str, encrypted: bool) -> Result<Account> {
        let running = self.running.lock().await;
        let Some(running) = running.as_ref() else {
            return Err(EngineError::NotRunning);
        };

        let plain;
        let blob = if encrypted {
            let cipher = running.cipher.as_ref().ok_or_else(|| {
                EngineError::Decryption(
                    "encrypted provisioning data without a configured key".to_string(),
                )
            })?;
            let opened = cipher.open_base64(post_data.trim())?;
            plain = String::from_utf8(opened).map_err(|_| {
                EngineError::Decryption("provisioning data is not valid UTF-8".to_string())
            })?;
            plain.as_str()
        } else {
            post_data
        };

        let data = ProvisioningData::parse(blob)?;
        running.signaling.register_account(data).await
    }

    pub async fn remove_account(&self, id: &str) -> Result<bool> {
        let running = self.running.lock().await;
        let Some(running) = running.as_ref() else {
            return Err(EngineError::NotRunning);
        };
        running.signaling.remove_account(id).await
    }

    /// Snapshot of all managed accounts.
    pub async fn accounts(&self) -> Result<Vec<Account>> {
        let running = self.running.lock().await;
        let Some(running) = running.as_ref() else {
            return Err(EngineError::NotRunning);
        };
        Ok(running.signaling.account_snapshot().await)
    }

    /// One host timer tick: run the periodic maintenance pass.
    pub async fn timer_tick(&self) -> Result<()> {
        let running = self.running.lock().await;
        let Some(running) = running.as_ref() else {
            return Err(EngineError::NotRunning);
        };
        running.signaling.sweep(Utc::now()).await
    }

    /// Address of the bound SIP listener.
    pub async fn sip_address(&self) -> Result<std::net::SocketAddr> {
        let running = self.running.lock().await;
        let Some(running) = running.as_ref() else {
            return Err(EngineError::NotRunning);
        };
        Ok(running.sip_address)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Tear the engine down. Stopping a stopped engine is a no-op.
    pub async fn stop(&self, option: StopOption) -> Result<()> {
        let mut guard = self.running.lock().await;
        let Some(running) = guard.take() else {
            debug!("stop called while not running");
            return Ok(());
        };

        running.inbound_task.abort();
        running.event_task.abort();
        let _ = running.http_shutdown.send(());
        let _ = running.http_task.await;

        match option {
            StopOption::RememberInstances => {
                let dialogs = running.signaling.dialog_snapshot().await;
                info!(count = dialogs.len(), "remembering dialogs across stop");
                running.store.save_dialogs(&dialogs).await?;
            }
            StopOption::ForgetInstances => {
                running.signaling.clear_dialogs().await;
                running.store.clear_dialogs().await?;
            }
        }

        running.store.close().await;
        if let Some(pid_file) = running.pid_file {
            if let Err(e) = std::fs::remove_file(&pid_file) {
                debug!(pid_file, error = %e, "pid file removal failed");
            }
        }
        info!("engine stopped");
        Ok(())
    }
}

/// Install the global tracing subscriber per the Log settings. Safe to call
/// more than once; later calls are ignored.
pub fn init_logging(log: &LogSettings) {
    // Stdio verbosity and file verbosity share one subscriber; take the
    // more verbose of the two
    let level = std::cmp::max(log.level, log.stdio_level);
    let builder = tracing_subscriber::fmt()
        .with_max_level(level.as_tracing_level())
        .with_target(false);
    let installed = match log.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::PlainText => builder.try_init(),
    };
    if installed.is_err() {
        debug!("tracing subscriber already installed");
    }
}
