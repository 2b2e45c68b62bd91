//! The signaling engine: registrar client and inbound request handling
//!
//! One engine instance owns the account cache, the dialog table and the
//! in-flight REGISTER transactions. Account state is committed to the store
//! before any response or notification leaves the engine, so a crash can lose
//! at most work that was never acknowledged.

use super::auth::DigestChallenge;
use super::builder::{self, RegisterParams, ResponseBuilder};
use super::message::{SipMessage, SipMethod, SipRequest, SipResponse};
use super::transport::{IncomingMessage, OutgoingMessage, TransportLayer, TransportProtocol};
use crate::config::{IncomingCallSettings, InstanceSettings};
use crate::domain::account::{Account, ProvisioningData, RegistrationState};
use crate::domain::dialog::{Dialog, DialogKind, Disposition};
use crate::domain::filter::{self, FilterDecision, FilterRule};
use crate::domain::shared::{EngineError, Result};
use crate::infrastructure::persistence::Store;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// How long a completed transaction is remembered for retransmission replay.
fn transaction_memory() -> Duration {
    Duration::seconds(32)
}

/// A REGISTER with no answer after this long counts as failed.
fn register_timeout() -> Duration {
    Duration::seconds(32)
}

/// Events the engine raises toward the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    IncomingCall {
        account_id: String,
        selector: String,
        call_id: String,
        remote: String,
    },
    IncomingMessage {
        account_id: String,
        selector: String,
        call_id: String,
        remote: String,
    },
    AboutToExpire {
        account_id: String,
        selector: String,
    },
    Expired {
        account_id: String,
        selector: String,
    },
    NotAnswered {
        account_id: String,
        selector: String,
        call_id: String,
    },
}

/// Static engine parameters derived from the settings tree.
#[derive(Debug, Clone)]
pub struct SipEngineConfig {
    /// host:port of the local SIP listener, placed in Via
    pub via_host: String,
    /// host:port advertised in Contact (the public address when configured)
    pub contact_host: String,
    pub instance: InstanceSettings,
    pub incoming_call: IncomingCallSettings,
    pub filters: Vec<FilterRule>,
}

/// Outbound REGISTER context for one account. Kept across refreshes so the
/// Call-ID and CSeq sequence stay stable the way registrars expect.
#[derive(Debug, Clone)]
struct RegContext {
    call_id: String,
    from_tag: String,
    cseq: u32,
    /// An unanswered REGISTER is in flight
    awaiting_since: Option<DateTime<Utc>>,
    /// The in-flight transaction already answered a challenge
    auth_attempted: bool,
    requested_expires: u32,
}

struct EngineState {
    accounts: HashMap<String, Account>,
    dialogs: HashMap<String, Dialog>,
    registrations: HashMap<String, RegContext>,
    /// transaction key -> (last response sent, when)
    seen: HashMap<String, (Bytes, DateTime<Utc>)>,
    last_keepalive: Option<DateTime<Utc>>,
}

pub struct SignalingEngine {
    config: SipEngineConfig,
    store: Arc<Store>,
    transport: Arc<TransportLayer>,
    events: mpsc::Sender<SignalingEvent>,
    state: Mutex<EngineState>,
}

impl SignalingEngine {
    pub fn new(
        config: SipEngineConfig,
        store: Arc<Store>,
        transport: Arc<TransportLayer>,
        events: mpsc::Sender<SignalingEvent>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            events,
            state: Mutex::new(EngineState {
                accounts: HashMap::new(),
                dialogs: HashMap::new(),
                registrations: HashMap::new(),
                seen: HashMap::new(),
                last_keepalive: None,
            }),
        }
    }

    /// Load persisted accounts into the cache and kick off registration for
    /// each of them. Returns the number of accounts resumed.
    pub async fn load_persisted(&self) -> Result<usize> {
        let accounts = self.store.list_accounts().await?;
        let count = accounts.len();

        let mut state = self.state.lock().await;
        for mut account in accounts {
            account.begin_registration();
            self.store.upsert_account(&account).await?;
            let id = account.id.clone();
            state.accounts.insert(id.clone(), account);
            if let Err(e) = self.send_register(&mut state, &id, None).await {
                warn!(account = %id, error = %e, "initial registration send failed");
                self.note_registration_failure(&mut state, &id).await?;
            }
        }
        info!(count, "resumed persisted accounts");
        Ok(count)
    }

    /// Restore a dialog snapshot saved by a previous shutdown.
    pub async fn restore_dialogs(&self, dialogs: Vec<Dialog>) {
        let mut state = self.state.lock().await;
        for dialog in dialogs {
            state.dialogs.insert(dialog.call_id.clone(), dialog);
        }
    }

    /// Provision (or refresh) an account and start registering it. The record
    /// is durable before this returns.
    pub async fn register_account(&self, data: ProvisioningData) -> Result<Account> {
        let mut state = self.state.lock().await;

        let id = format!("{}@{}", data.username, data.domain);
        let account = match state.accounts.get_mut(&id) {
            Some(existing) => {
                // Refresh of a known account keeps its history
                existing.password = data.password;
                existing.requested_expires = data.expires;
                existing.premium = data.premium;
                existing.selector = data.selector;
                existing.transport = data.transport;
                existing.begin_registration();
                existing.clone()
            }
            None => {
                let mut account = Account::from_provisioning(data);
                account.begin_registration();
                state.accounts.insert(id.clone(), account.clone());
                account
            }
        };

        self.store.upsert_account(&account).await?;

        if let Err(e) = self.send_register(&mut state, &id, None).await {
            warn!(account = %id, error = %e, "registration send failed");
            self.note_registration_failure(&mut state, &id).await?;
        }

        Ok(state.accounts.get(&id).cloned().unwrap_or(account))
    }

    /// Drop an account: best-effort de-registration, then durable removal.
    pub async fn remove_account(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(account) = state.accounts.get(id).cloned() else {
            return Ok(false);
        };

        if account.is_registered() {
            if let Some(ctx) = state.registrations.get_mut(id) {
                ctx.requested_expires = 0;
            }
            if let Err(e) = self.send_register(&mut state, id, None).await {
                debug!(account = id, error = %e, "de-registration send failed");
            }
        }

        state.accounts.remove(id);
        state.registrations.remove(id);
        state.dialogs.retain(|_, d| d.account_id != id);
        self.store.delete_account(id).await?;
        info!(account = id, "account removed");
        Ok(true)
    }

    pub async fn account_snapshot(&self) -> Vec<Account> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    pub async fn dialog_snapshot(&self) -> Vec<Dialog> {
        let state = self.state.lock().await;
        state.dialogs.values().cloned().collect()
    }

    pub async fn clear_dialogs(&self) {
        let mut state = self.state.lock().await;
        state.dialogs.clear();
    }

    /// Demultiplex one inbound message.
    pub async fn handle_incoming(&self, incoming: IncomingMessage) -> Result<()> {
        match incoming.message {
            SipMessage::Response(response) => self.handle_response(response).await,
            SipMessage::Request(request) => {
                self.handle_request(request, incoming.source, incoming.protocol)
                    .await
            }
        }
    }

    // ---- outbound registration ----

    /// Send (or resend) a REGISTER for the account, advancing its CSeq.
    async fn send_register(
        &self,
        state: &mut EngineState,
        account_id: &str,
        authorization: Option<String>,
    ) -> Result<()> {
        let account = state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| EngineError::Registration(format!("unknown account {}", account_id)))?;

        let answering_challenge = authorization.is_some();
        let ctx = state
            .registrations
            .entry(account_id.to_string())
            .or_insert_with(|| RegContext {
                call_id: builder::make_call_id(&self.config.via_host),
                from_tag: builder::make_tag(),
                cseq: 0,
                awaiting_since: None,
                auth_attempted: false,
                requested_expires: account.requested_expires,
            });
        ctx.cseq += 1;
        ctx.awaiting_since = Some(Utc::now());
        ctx.auth_attempted = answering_challenge;
        let params = RegisterParams {
            username: &account.username,
            registrar: &account.domain,
            contact_host: &self.config.contact_host,
            via_host: &self.config.via_host,
            user_agent: &self.config.instance.user_agent,
            call_id: &ctx.call_id,
            cseq: ctx.cseq,
            expires: ctx.requested_expires,
            from_tag: &ctx.from_tag,
            authorization,
        };
        let request = builder::build_register_request(&params)
            .map_err(|e| EngineError::Protocol(e.to_string()))?;

        let protocol = TransportProtocol::from_account_transport(account.transport.as_deref());
        let (destination, host) = resolve_registrar(&account.domain, protocol).await?;

        debug!(
            account = %account.id,
            cseq = state.registrations[account_id].cseq,
            %destination,
            protocol = protocol.as_str(),
            "sending REGISTER"
        );

        self.transport
            .send(OutgoingMessage {
                data: request.to_bytes(),
                destination,
                protocol,
                host: Some(host),
            })
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        Ok(())
    }

    async fn note_registration_failure(
        &self,
        state: &mut EngineState,
        account_id: &str,
    ) -> Result<()> {
        let instance = self.config.instance.clone();
        if let Some(account) = state.accounts.get_mut(account_id) {
            let cap = account.max_age(instance.max_age, instance.premium_max_age);
            account.registration_failed(Utc::now(), cap);
            let snapshot = account.clone();
            self.store.upsert_account(&snapshot).await?;
        }
        if let Some(ctx) = state.registrations.get_mut(account_id) {
            ctx.awaiting_since = None;
        }
        Ok(())
    }

    // ---- inbound responses ----

    async fn handle_response(&self, response: SipResponse) -> Result<()> {
        if response.cseq_method().as_deref() != Some("REGISTER") {
            debug!(
                status = response.status_code(),
                method = ?response.cseq_method(),
                "ignoring response to non-REGISTER transaction"
            );
            return Ok(());
        }

        let Some(call_id) = response.call_id() else {
            return Ok(());
        };

        let mut state = self.state.lock().await;
        let Some(account_id) = state
            .registrations
            .iter()
            .find(|(_, ctx)| ctx.call_id == call_id)
            .map(|(id, _)| id.clone())
        else {
            debug!(%call_id, "response does not match any registration in flight");
            return Ok(());
        };

        let status = response.status_code();
        match status {
            100..=199 => Ok(()),
            200..=299 => self.registration_accepted(&mut state, &account_id, &response).await,
            401 | 407 => self.registration_challenged(&mut state, &account_id, &response).await,
            _ => {
                warn!(account = %account_id, status, "registration rejected");
                self.note_registration_failure(&mut state, &account_id).await
            }
        }
    }

    async fn registration_accepted(
        &self,
        state: &mut EngineState,
        account_id: &str,
        response: &SipResponse,
    ) -> Result<()> {
        let requested = state
            .registrations
            .get(account_id)
            .map(|c| c.requested_expires)
            .unwrap_or(0);
        if let Some(ctx) = state.registrations.get_mut(account_id) {
            ctx.awaiting_since = None;
            ctx.auth_attempted = false;
        }

        // A 200 for an expires=0 transaction confirms de-registration
        if requested == 0 {
            debug!(account = account_id, "de-registration confirmed");
            return Ok(());
        }

        let granted = response.granted_expires().unwrap_or(requested);
        if let Some(account) = state.accounts.get_mut(account_id) {
            account.registration_succeeded(granted, Utc::now());
            let snapshot = account.clone();
            self.store.upsert_account(&snapshot).await?;
            info!(account = %account_id, granted, "registration accepted");
        }
        Ok(())
    }

    async fn registration_challenged(
        &self,
        state: &mut EngineState,
        account_id: &str,
        response: &SipResponse,
    ) -> Result<()> {
        let already_tried = state
            .registrations
            .get(account_id)
            .map(|c| c.auth_attempted)
            .unwrap_or(false);
        if already_tried {
            warn!(account = %account_id, "credentials rejected by registrar");
            return self.note_registration_failure(state, account_id).await;
        }

        let Some(challenge_value) = response.auth_challenge() else {
            warn!(account = %account_id, "401/407 without a challenge header");
            return self.note_registration_failure(state, account_id).await;
        };

        let (username, password, domain) = match state.accounts.get(account_id) {
            Some(a) => (a.username.clone(), a.password.clone(), a.domain.clone()),
            None => return Ok(()),
        };

        let authorization = DigestChallenge::parse(&challenge_value)
            .and_then(|c| c.answer(&username, &password, "REGISTER", &format!("sip:{}", domain)));
        match authorization {
            Ok(authorization) => {
                debug!(account = %account_id, "answering digest challenge");
                if let Err(e) = self.send_register(state, account_id, Some(authorization)).await {
                    warn!(account = %account_id, error = %e, "challenged REGISTER send failed");
                    return self.note_registration_failure(state, account_id).await;
                }
                Ok(())
            }
            Err(e) => {
                warn!(account = %account_id, error = %e, "cannot answer digest challenge");
                self.note_registration_failure(state, account_id).await
            }
        }
    }

    // ---- inbound requests ----

    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<()> {
        let Some(method) = request.method() else {
            return self.respond(&request, 501, source, protocol, false).await;
        };

        // Retransmission: replay the cached response without re-processing
        if let Some(key) = request.transaction_key() {
            let state = self.state.lock().await;
            if let Some((cached, _)) = state.seen.get(&key) {
                debug!(%key, "retransmission, replaying cached response");
                let data = cached.clone();
                drop(state);
                return self.send_raw(data, source, protocol).await;
            }
        }

        match method {
            SipMethod::Options => self.respond(&request, 200, source, protocol, true).await,
            SipMethod::Invite => self.handle_invite(request, source, protocol).await,
            SipMethod::Message => self.handle_message(request, source, protocol).await,
            SipMethod::Cancel => self.handle_cancel(request, source, protocol).await,
            SipMethod::Bye => self.handle_bye(request, source, protocol).await,
            SipMethod::Ack => {
                // ACK is unacknowledged by definition
                if let Some(call_id) = request.call_id() {
                    let mut state = self.state.lock().await;
                    if let Some(dialog) = state.dialogs.get_mut(&call_id) {
                        dialog.touch();
                    }
                }
                Ok(())
            }
            SipMethod::Register => {
                // The engine is a registrar client, never a registrar
                self.respond(&request, 405, source, protocol, true).await
            }
        }
    }

    async fn handle_invite(
        &self,
        request: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<()> {
        let Some(call_id) = request.call_id() else {
            return self.respond(&request, 400, source, protocol, true).await;
        };

        let mut state = self.state.lock().await;
        let Some(account) = find_account_for(&state.accounts, &request) else {
            drop(state);
            return self.respond(&request, 404, source, protocol, true).await;
        };
        let (account_id, selector) = (account.id.clone(), account.selector.clone());

        let remote = request.from_value().unwrap_or_default();
        let dialog = Dialog::new(
            call_id.clone(),
            DialogKind::Call,
            account_id.clone(),
            remote.clone(),
        );
        state.dialogs.insert(call_id.clone(), dialog);
        info!(account = %account_id, %call_id, "incoming call");
        drop(state);

        self.respond(&request, 180, source, protocol, true).await?;

        let _ = self
            .events
            .send(SignalingEvent::IncomingCall {
                account_id,
                selector,
                call_id,
                remote,
            })
            .await;
        Ok(())
    }

    async fn handle_message(
        &self,
        request: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<()> {
        let headers = request.header_pairs();
        let decision = filter::evaluate(&self.config.filters, &headers);

        let state = self.state.lock().await;
        let account = find_account_for(&state.accounts, &request).cloned();
        drop(state);

        let Some(account) = account else {
            return self.respond(&request, 404, source, protocol, true).await;
        };

        match decision {
            FilterDecision::Reject { code, phrase } => {
                info!(account = %account.id, code, %phrase, "message rejected by filter");
                self.respond_with(&request, code, Some(phrase), source, protocol, true)
                    .await
            }
            FilterDecision::AcceptAndDrop => {
                debug!(account = %account.id, "message dropped by filter");
                self.respond(&request, 200, source, protocol, true).await
            }
            FilterDecision::AcceptAndDoNotPush => {
                debug!(account = %account.id, "message accepted without push");
                self.respond(&request, 200, source, protocol, true).await
            }
            FilterDecision::AcceptAndPush => {
                self.respond(&request, 200, source, protocol, true).await?;
                let _ = self
                    .events
                    .send(SignalingEvent::IncomingMessage {
                        account_id: account.id,
                        selector: account.selector,
                        call_id: request.call_id().unwrap_or_default(),
                        remote: request.from_value().unwrap_or_default(),
                    })
                    .await;
                Ok(())
            }
        }
    }

    async fn handle_cancel(
        &self,
        request: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<()> {
        self.respond(&request, 200, source, protocol, true).await?;

        let Some(call_id) = request.call_id() else {
            return Ok(());
        };
        let mut state = self.state.lock().await;
        // A cancelled invite is a missed call
        let terminated = state
            .dialogs
            .get_mut(&call_id)
            .map(|d| (d.terminate(Disposition::NotAnswered), d.account_id.clone()));
        let event = match terminated {
            Some((true, account_id)) => {
                state
                    .accounts
                    .get(&account_id)
                    .map(|account| SignalingEvent::NotAnswered {
                        account_id: account.id.clone(),
                        selector: account.selector.clone(),
                        call_id: call_id.clone(),
                    })
            }
            _ => None,
        };
        drop(state);

        if let Some(event) = event {
            let _ = self.events.send(event).await;
        }
        Ok(())
    }

    async fn handle_bye(
        &self,
        request: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<()> {
        self.respond(&request, 200, source, protocol, true).await?;
        if let Some(call_id) = request.call_id() {
            let mut state = self.state.lock().await;
            if let Some(dialog) = state.dialogs.get_mut(&call_id) {
                dialog.terminate(Disposition::Completed);
            }
        }
        Ok(())
    }

    /// Build, cache and send a response for a request.
    async fn respond(
        &self,
        request: &SipRequest,
        status: u16,
        source: SocketAddr,
        protocol: TransportProtocol,
        cache: bool,
    ) -> Result<()> {
        self.respond_with(request, status, None, source, protocol, cache)
            .await
    }

    /// Like `respond`, with a custom reason phrase on the status line.
    async fn respond_with(
        &self,
        request: &SipRequest,
        status: u16,
        phrase: Option<String>,
        source: SocketAddr,
        protocol: TransportProtocol,
        cache: bool,
    ) -> Result<()> {
        let mut builder = ResponseBuilder::new(status);
        if let Some(phrase) = phrase {
            builder = builder.with_phrase(phrase);
        }
        let response = builder
            .build_for_request(request)
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        let data = response.to_bytes();

        if cache {
            if let Some(key) = request.transaction_key() {
                let mut state = self.state.lock().await;
                state.seen.insert(key, (data.clone(), Utc::now()));
            }
        }
        self.send_raw(data, source, protocol).await
    }

    async fn send_raw(
        &self,
        data: Bytes,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<()> {
        self.transport
            .send(OutgoingMessage {
                data,
                destination,
                protocol,
                host: None,
            })
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))
    }

    // ---- periodic maintenance ----

    /// One maintenance pass, run from the host timer: registration expiry and
    /// refresh, retry backoff, call timeouts, eviction, keepalives.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let instance = self.config.instance.clone();

        let memory = transaction_memory();
        state.seen.retain(|_, v| now - v.1 < memory);

        // Unanswered REGISTER transactions time out into the retry path
        let timed_out: Vec<String> = state
            .registrations
            .iter()
            .filter(|(_, ctx)| {
                ctx.awaiting_since
                    .map(|at| now - at > register_timeout())
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in timed_out {
            warn!(account = %id, "REGISTER transaction timed out");
            self.note_registration_failure(&mut state, &id).await?;
        }

        let account_ids: Vec<String> = state.accounts.keys().cloned().collect();
        let mut events = Vec::new();
        for id in account_ids {
            self.sweep_account(&mut state, &id, now, &instance, &mut events)
                .await?;
        }

        // Ringing calls that nobody answered
        let call_timeout = self.config.incoming_call.not_answered_max_age;
        let expired_calls: Vec<String> = state
            .dialogs
            .values()
            .filter(|d| d.kind == DialogKind::Call && d.not_answered_timeout(now, call_timeout))
            .map(|d| d.call_id.clone())
            .collect();
        for call_id in expired_calls {
            let terminated = state
                .dialogs
                .get_mut(&call_id)
                .map(|d| (d.terminate(Disposition::NotAnswered), d.account_id.clone()));
            if let Some((true, account_id)) = terminated {
                if let Some(account) = state.accounts.get(&account_id) {
                    events.push(SignalingEvent::NotAnswered {
                        account_id: account.id.clone(),
                        selector: account.selector.clone(),
                        call_id,
                    });
                }
            }
        }
        state.dialogs.retain(|_, d| !d.is_terminal());

        self.send_keepalives(&mut state, now).await;
        drop(state);

        for event in events {
            let _ = self.events.send(event).await;
        }
        Ok(())
    }

    async fn sweep_account(
        &self,
        state: &mut EngineState,
        id: &str,
        now: DateTime<Utc>,
        instance: &InstanceSettings,
        events: &mut Vec<SignalingEvent>,
    ) -> Result<()> {
        let Some(account) = state.accounts.get(id).cloned() else {
            return Ok(());
        };

        // Eviction of accounts that never managed to (re-)register
        if account.eviction_due(now, instance.not_registered_max_age) {
            info!(account = id, "evicting account that stayed unregistered");
            state.accounts.remove(id);
            state.registrations.remove(id);
            self.store.delete_account(id).await?;
            return Ok(());
        }

        let remaining = account.remaining_validity(now);

        // Hard expiry
        if account.is_registered() && remaining.map(|r| r <= Duration::zero()).unwrap_or(false) {
            if let Some(acct) = state.accounts.get_mut(id) {
                acct.mark_expired();
                let snapshot = acct.clone();
                self.store.upsert_account(&snapshot).await?;
            }
            warn!(account = id, "registration expired");
            events.push(SignalingEvent::Expired {
                account_id: account.id.clone(),
                selector: account.selector.clone(),
            });
            // Immediately try to win the registration back
            if let Some(acct) = state.accounts.get_mut(id) {
                acct.begin_registration();
                let snapshot = acct.clone();
                self.store.upsert_account(&snapshot).await?;
            }
            if let Err(e) = self.send_register(state, id, None).await {
                debug!(account = id, error = %e, "re-registration send failed");
                self.note_registration_failure(state, id).await?;
            }
            return Ok(());
        }

        // About-to-expire: refresh once, notify per the configured windows
        if account.state == RegistrationState::Registered {
            if let (Some(window), Some(remaining)) = (&instance.about_to_expire_in, remaining) {
                if remaining <= window.threshold {
                    if let Some(acct) = state.accounts.get_mut(id) {
                        acct.mark_about_to_expire().ok();
                        let snapshot = acct.clone();
                        self.store.upsert_account(&snapshot).await?;
                    }
                    if let Err(e) = self.send_register(state, id, None).await {
                        debug!(account = id, error = %e, "refresh REGISTER send failed");
                    }
                }
            }
        }

        if account.is_registered() {
            if let Some(remaining) = remaining {
                self.raise_expiry_notices(state, id, remaining, instance, events)
                    .await?;
            }
        }

        // Retry backoff for failed registrations
        if account.retry_due(now) {
            if let Some(acct) = state.accounts.get_mut(id) {
                acct.begin_registration();
                acct.retry.next_attempt_at = None;
                let snapshot = acct.clone();
                self.store.upsert_account(&snapshot).await?;
            }
            debug!(account = id, "retrying registration");
            if let Err(e) = self.send_register(state, id, None).await {
                debug!(account = id, error = %e, "retry REGISTER send failed");
                self.note_registration_failure(state, id).await?;
            }
        }
        Ok(())
    }

    /// One-shot and periodic about-to-expire notices, each with its own
    /// silent sub-window in which the refresh still runs but no push is raised.
    async fn raise_expiry_notices(
        &self,
        state: &mut EngineState,
        id: &str,
        remaining: Duration,
        instance: &InstanceSettings,
        events: &mut Vec<SignalingEvent>,
    ) -> Result<()> {
        let now = Utc::now();
        let Some(account) = state.accounts.get_mut(id) else {
            return Ok(());
        };

        let mut raise = false;
        if let Some(window) = &instance.about_to_expire_in {
            if remaining <= window.threshold
                && remaining > window.silent
                && !account.about_to_expire_notified
            {
                account.about_to_expire_notified = true;
                raise = true;
            }
        }
        if let Some(window) = &instance.about_to_expire_period {
            if remaining <= window.threshold && remaining > window.silent {
                let due = match account.last_periodic_notice {
                    Some(last) => now - last >= window.threshold,
                    None => true,
                };
                if due {
                    account.last_periodic_notice = Some(now);
                    raise = true;
                }
            }
        }

        if raise {
            let snapshot = account.clone();
            self.store.upsert_account(&snapshot).await?;
            events.push(SignalingEvent::AboutToExpire {
                account_id: snapshot.id,
                selector: snapshot.selector,
            });
        }
        Ok(())
    }

    /// Double-CRLF keepalives toward every registrar with a live registration.
    async fn send_keepalives(&self, state: &mut EngineState, now: DateTime<Utc>) {
        let keep_alive = &self.config.instance.keep_alive;
        if !keep_alive.enabled {
            return;
        }
        let due = match state.last_keepalive {
            Some(last) => now - last >= keep_alive.period,
            None => true,
        };
        if !due {
            return;
        }
        state.last_keepalive = Some(now);

        let targets: Vec<(String, Option<String>)> = state
            .accounts
            .values()
            .filter(|a| a.is_registered())
            .map(|a| (a.domain.clone(), a.transport.clone()))
            .collect();
        for (domain, transport) in targets {
            let protocol = TransportProtocol::from_account_transport(transport.as_deref());
            if protocol != TransportProtocol::Udp {
                // Stream transports keep their own connection alive
                continue;
            }
            match resolve_registrar(&domain, protocol).await {
                Ok((destination, _)) => {
                    let msg = OutgoingMessage {
                        data: Bytes::from_static(builder::keepalive_packet()),
                        destination,
                        protocol,
                        host: None,
                    };
                    if let Err(e) = self.transport.send(msg).await {
                        debug!(%domain, error = %e, "keepalive send failed");
                    }
                }
                Err(e) => debug!(%domain, error = %e, "keepalive resolve failed"),
            }
        }
    }
}

/// Resolve a registrar address (host or host:port) for the given transport.
async fn resolve_registrar(
    domain: &str,
    protocol: TransportProtocol,
) -> Result<(SocketAddr, String)> {
    let default_port = match protocol {
        TransportProtocol::Tls => 5061,
        _ => 5060,
    };
    let (host, port) = match domain.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => {
            (h.to_string(), p.parse().unwrap_or(default_port))
        }
        _ => (domain.to_string(), default_port),
    };

    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| EngineError::Protocol(format!("cannot resolve registrar {}: {}", domain, e)))?
        .next()
        .ok_or_else(|| {
            EngineError::Protocol(format!("registrar {} resolved to no address", domain))
        })?;
    Ok((addr, host))
}

/// Extract user@host from a From/To header value.
fn aor_in(value: &str) -> Option<String> {
    let start = value.find("sip:")? + 4;
    let rest = &value[start..];
    let end = rest
        .find(|c: char| c == '>' || c == ';' || c.is_whitespace())
        .unwrap_or(rest.len());
    let aor = &rest[..end];
    // Drop an explicit port from the host part
    match aor.rsplit_once(':') {
        Some((head, p)) if p.chars().all(|c| c.is_ascii_digit()) => Some(head.to_string()),
        _ => Some(aor.to_string()),
    }
}

/// Locate the managed account an inbound request is addressed to, via the To
/// header first and the request URI user as a fallback.
fn find_account_for<'a>(
    accounts: &'a HashMap<String, Account>,
    request: &SipRequest,
) -> Option<&'a Account> {
    if let Some(aor) = request.to_value().as_deref().and_then(aor_in) {
        if let Some(account) = accounts.get(&aor) {
            return Some(account);
        }
        if let Some(user) = aor.split('@').next() {
            if let Some(account) = accounts.values().find(|a| a.username == user) {
                return Some(account);
            }
        }
    }
    let user = request.uri().auth.as_ref().map(|a| a.user.clone())?;
    accounts.values().find(|a| a.username == user)
}
