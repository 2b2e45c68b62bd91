//! Dialog entity: an in-flight call or message transaction
//!
//! Dialogs are owned by the signaling engine and normally never persisted;
//! `stop(RememberInstances)` snapshots them for resumption.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What kind of signaling exchange the dialog tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogKind {
    Call,
    Message,
}

/// Terminal outcome of a dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    Answered,
    NotAnswered,
    Rejected,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogState {
    /// Created on INVITE/MESSAGE receipt, awaiting a terminal response
    Pending,
    Terminated(Disposition),
}

/// An active signaling exchange bound to an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialog {
    /// SIP Call-ID
    pub call_id: String,
    pub kind: DialogKind,
    pub account_id: String,
    /// Remote party (From header URI)
    pub remote: String,
    pub state: DialogState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Dialog {
    pub fn new(call_id: String, kind: DialogKind, account_id: String, remote: String) -> Self {
        let now = Utc::now();
        Self {
            call_id,
            kind,
            account_id,
            remote,
            state: DialogState::Pending,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, DialogState::Terminated(_))
    }

    /// Record signaling activity (retransmissions, provisional responses).
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Drive the dialog to a terminal state. Returns true only on the first
    /// transition so a disposition is reported exactly once.
    pub fn terminate(&mut self, disposition: Disposition) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = DialogState::Terminated(disposition);
        self.last_activity = Utc::now();
        true
    }

    /// Whether the dialog sat unanswered past the configured max age.
    pub fn not_answered_timeout(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        !self.is_terminal() && now - self.created_at > max_age
    }
}
