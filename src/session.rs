//! Visitor identities and session state.
//!
//! Each virtual user owns its [`SessionState`], nothing here is shared between users.
//! A session is a sequence of page views by one visitor identity, in one browser, ending
//! after a planned number of page views. Interaction events happen within the session
//! but don't count towards its length.

use rand::Rng;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio::time::Instant;

use crate::behavior::{random_alphanumeric, random_hex, BehaviorModel};

/// Whether a virtual user keeps its visitor identity across sessions.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum IdentityPolicy {
    /// One identity for every session of a virtual user, a returning visitor.
    #[default]
    Persistent,
    /// A fresh identity for each session, a new visitor every time.
    PerSession,
}

/// Who the tracker believes is visiting.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VisitorIdentity {
    /// 16 lowercase hexadecimal characters, sent as `_id` and `cid`.
    pub visitor_id: String,
    /// Set for logged-in visitors, sent as `uid`.
    pub user_id: Option<String>,
}
impl VisitorIdentity {
    /// Generate an identity, logged-in with the model's user id probability.
    pub fn generate<R: Rng + ?Sized>(model: &BehaviorModel, rng: &mut R) -> Self {
        let visitor_id = random_hex(rng, 16);
        let user_id = if rng.random_bool(model.user_id_probability) {
            Some(format!("user_{}", random_alphanumeric(rng, 12)))
        } else {
            None
        };
        VisitorIdentity {
            visitor_id,
            user_id,
        }
    }
}

/// The inclusive range of page views a session may last.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub min_length: usize,
    pub max_length: usize,
}
impl SessionSettings {
    /// Draw the planned length of a new session.
    pub fn planned_length<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        rng.random_range(self.min_length..=self.max_length)
    }
}

/// A single visit.
#[derive(Clone, Debug)]
pub struct Session {
    /// Sessions started by this virtual user, starting at 1.
    pub number: usize,
    pub started_at: Instant,
    /// Page views tracked so far in this session.
    pub page_view_count: usize,
    /// The number of page views after which the session ends.
    pub planned_length: usize,
    /// The browser, chosen once per session.
    pub user_agent: String,
    /// The last page viewed, interaction events happen on this page.
    pub current_url: Option<String>,
}
impl Session {
    pub fn is_complete(&self) -> bool {
        self.page_view_count >= self.planned_length
    }
}

/// The identity and session of one virtual user.
#[derive(Debug)]
pub struct SessionState {
    policy: IdentityPolicy,
    settings: SessionSettings,
    identity: Option<VisitorIdentity>,
    session: Option<Session>,
    sessions_started: usize,
}
impl SessionState {
    pub fn new(policy: IdentityPolicy, settings: SessionSettings) -> Self {
        SessionState {
            policy,
            settings,
            identity: None,
            session: None,
            sessions_started: 0,
        }
    }

    /// Start a new session if there is none or the last one is complete.
    ///
    /// Returns true if a session was started. The identity is created on first use, and
    /// regenerated at every session start under [`IdentityPolicy::PerSession`].
    pub fn ensure_session<R: Rng + ?Sized>(&mut self, model: &BehaviorModel, rng: &mut R) -> bool {
        if self.session.as_ref().is_some_and(|session| !session.is_complete()) {
            return false;
        }

        if self.identity.is_none() || self.policy == IdentityPolicy::PerSession {
            self.identity = Some(VisitorIdentity::generate(model, rng));
        }
        self.sessions_started += 1;
        self.session = Some(Session {
            number: self.sessions_started,
            started_at: Instant::now(),
            page_view_count: 0,
            planned_length: self.settings.planned_length(rng),
            user_agent: model.user_agent(rng),
            current_url: None,
        });
        true
    }

    /// Count a page view, it becomes the page later interactions happen on.
    pub fn record_page_view(&mut self, url: &str) {
        if let Some(session) = self.session.as_mut() {
            session.page_view_count += 1;
            session.current_url = Some(url.to_string());
        }
    }

    pub fn identity(&self) -> Option<&VisitorIdentity> {
        self.identity.as_ref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Both the identity and the session, once a session was started.
    pub fn current(&self) -> Option<(&VisitorIdentity, &Session)> {
        Some((self.identity.as_ref()?, self.session.as_ref()?))
    }

    pub fn sessions_started(&self) -> usize {
        self.sessions_started
    }
}
