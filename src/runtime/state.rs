//! Phase vocabulary and legal-transition tables
//!
//! Every hook returns a [`VclAction`]. The frontend and backend machines map
//! that action onto their own phase enums and check the move against a
//! static adjacency table before touching any request state.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::TransitionError;

/// Value returned by every compiled subroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VclAction {
    /// Sentinel returned by custom subroutines that fell off their end.
    NoOp,
    /// Success marker for `vcl_init`/`vcl_term`.
    Ok,
    /// Restart the request from the top.
    Restart,
    /// Enter the receive phase.
    Receive,
    /// Compute the request hash.
    Hash,
    /// Look the hash up in the cache.
    Lookup,
    /// Another request is already fetching this object.
    Busy,
    /// Purge the cached object.
    Purge,
    /// Fetch from the backend without caching.
    Pass,
    /// Hand the connection to the backend.
    Pipe,
    /// Produce a synthetic response.
    Synth,
    /// Cache hit.
    Hit,
    /// Cache miss.
    Miss,
    /// Cached marker forcing a pass.
    HitForPass,
    /// Issue the backend fetch.
    Fetch,
    /// Deliver the object/response.
    Deliver,
    /// Write the response to the client (internal phase).
    DeliverContent,
    /// Request finished.
    Done,
    /// Enter the error phase.
    Error,
    /// Retry the backend fetch.
    Retry,
    /// Give up on the backend fetch.
    Abandon,
    /// Run the backend response hook.
    Response,
}

const ALL_ACTIONS: &[VclAction] = &[
    VclAction::NoOp,
    VclAction::Ok,
    VclAction::Restart,
    VclAction::Receive,
    VclAction::Hash,
    VclAction::Lookup,
    VclAction::Busy,
    VclAction::Purge,
    VclAction::Pass,
    VclAction::Pipe,
    VclAction::Synth,
    VclAction::Hit,
    VclAction::Miss,
    VclAction::HitForPass,
    VclAction::Fetch,
    VclAction::Deliver,
    VclAction::DeliverContent,
    VclAction::Done,
    VclAction::Error,
    VclAction::Retry,
    VclAction::Abandon,
    VclAction::Response,
];

impl VclAction {
    /// Lower-case DSL spelling of the action.
    pub fn name(self) -> &'static str {
        match self {
            VclAction::NoOp => "noop",
            VclAction::Ok => "ok",
            VclAction::Restart => "restart",
            VclAction::Receive => "receive",
            VclAction::Hash => "hash",
            VclAction::Lookup => "lookup",
            VclAction::Busy => "busy",
            VclAction::Purge => "purge",
            VclAction::Pass => "pass",
            VclAction::Pipe => "pipe",
            VclAction::Synth => "synth",
            VclAction::Hit => "hit",
            VclAction::Miss => "miss",
            VclAction::HitForPass => "hitforpass",
            VclAction::Fetch => "fetch",
            VclAction::Deliver => "deliver",
            VclAction::DeliverContent => "delivercontent",
            VclAction::Done => "done",
            VclAction::Error => "error",
            VclAction::Retry => "retry",
            VclAction::Abandon => "abandon",
            VclAction::Response => "response",
        }
    }

    /// Resolve a `return(<name>)` target. Dashes and underscores are ignored
    /// and the comparison is case-insensitive, so `hit-for-pass` works.
    pub fn from_dsl(name: &str) -> Option<VclAction> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        ALL_ACTIONS
            .iter()
            .copied()
            .find(|action| action.name() == normalized)
    }
}

impl fmt::Display for VclAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Client-facing request phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrontendState {
    /// Entry point and restart target.
    Restart,
    /// `vcl_recv`.
    Receive,
    /// `vcl_hash`.
    Hash,
    /// Cache lookup.
    Lookup,
    /// Waiting on another fetch for the same object.
    Busy,
    /// `vcl_hit`.
    Hit,
    /// `vcl_miss`.
    Miss,
    /// Cached pass marker, handled like Pass.
    HitForPass,
    /// `vcl_pass`.
    Pass,
    /// `vcl_pipe`.
    Pipe,
    /// `vcl_purge`.
    Purge,
    /// Backend fetch machine.
    Fetch,
    /// `vcl_deliver`.
    Deliver,
    /// `vcl_synth`.
    Synth,
    /// `vcl_error`.
    Error,
    /// Response write.
    DeliverContent,
    /// Terminal.
    Done,
}

impl FrontendState {
    /// Phases reachable from `self`.
    pub fn transitions(self) -> &'static [FrontendState] {
        use FrontendState::*;
        match self {
            Restart => &[Synth, Receive],
            Receive => &[Hash, Purge, Pass, Pipe, Synth],
            Hash => &[Lookup],
            Lookup => &[Hit, Miss, HitForPass, Busy],
            Busy => &[Lookup],
            Hit => &[Deliver, Miss, Restart, Synth, Pass],
            Miss => &[Fetch, Restart, Synth, Pass],
            HitForPass => &[Synth, Fetch, Restart],
            Pass => &[Synth, Fetch, Restart],
            Pipe => &[Synth, Fetch],
            Purge => &[Synth, Restart],
            Fetch => &[Deliver, Restart],
            Deliver => &[Synth, Restart, DeliverContent],
            Synth => &[DeliverContent, Restart],
            Error => &[Restart, DeliverContent],
            DeliverContent => &[Done],
            Done => &[],
        }
    }

    /// Whether `next` is in the adjacency table for `self`.
    pub fn can_transition(self, next: FrontendState) -> bool {
        self.transitions().contains(&next)
    }

    /// Validate a move, returning the target on success.
    pub fn transition(self, next: FrontendState) -> Result<FrontendState, TransitionError> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(TransitionError::Frontend {
                from: self,
                to: next,
            })
        }
    }

    /// Frontend phase named by an action, if any.
    pub fn from_action(action: VclAction) -> Option<FrontendState> {
        Some(match action {
            VclAction::Restart => FrontendState::Restart,
            VclAction::Receive => FrontendState::Receive,
            VclAction::Hash => FrontendState::Hash,
            VclAction::Lookup => FrontendState::Lookup,
            VclAction::Busy => FrontendState::Busy,
            VclAction::Hit => FrontendState::Hit,
            VclAction::Miss => FrontendState::Miss,
            VclAction::HitForPass => FrontendState::HitForPass,
            VclAction::Pass => FrontendState::Pass,
            VclAction::Pipe => FrontendState::Pipe,
            VclAction::Purge => FrontendState::Purge,
            VclAction::Fetch => FrontendState::Fetch,
            VclAction::Deliver => FrontendState::Deliver,
            VclAction::Synth => FrontendState::Synth,
            VclAction::Error => FrontendState::Error,
            VclAction::DeliverContent => FrontendState::DeliverContent,
            VclAction::Done => FrontendState::Done,
            VclAction::NoOp
            | VclAction::Ok
            | VclAction::Retry
            | VclAction::Abandon
            | VclAction::Response => return None,
        })
    }

    /// Whether no further transitions exist.
    pub fn is_terminal(self) -> bool {
        self.transitions().is_empty()
    }
}

/// Origin-facing fetch phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendState {
    /// Attempt accounting and backend request construction.
    Retry,
    /// `vcl_backend_fetch` plus the outbound call.
    Fetch,
    /// `vcl_backend_response`.
    Response,
    /// `vcl_backend_error`.
    Error,
    /// Terminal success.
    Deliver,
    /// Terminal failure.
    Abandon,
}

impl BackendState {
    /// Phases reachable from `self`.
    pub fn transitions(self) -> &'static [BackendState] {
        use BackendState::*;
        match self {
            Retry => &[Fetch, Deliver, Abandon],
            Fetch => &[Response, Error, Deliver, Abandon],
            Response => &[Deliver, Error, Retry, Abandon],
            Error => &[Retry, Deliver, Abandon],
            Deliver | Abandon => &[],
        }
    }

    /// Whether `next` is in the adjacency table for `self`.
    pub fn can_transition(self, next: BackendState) -> bool {
        self.transitions().contains(&next)
    }

    /// Validate a move, returning the target on success.
    pub fn transition(self, next: BackendState) -> Result<BackendState, TransitionError> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(TransitionError::Backend {
                from: self,
                to: next,
            })
        }
    }

    /// Backend phase named by an action, if any.
    pub fn from_action(action: VclAction) -> Option<BackendState> {
        match action {
            VclAction::Retry => Some(BackendState::Retry),
            VclAction::Fetch => Some(BackendState::Fetch),
            VclAction::Response => Some(BackendState::Response),
            VclAction::Error => Some(BackendState::Error),
            VclAction::Deliver => Some(BackendState::Deliver),
            VclAction::Abandon => Some(BackendState::Abandon),
            _ => None,
        }
    }

    /// Whether no further transitions exist.
    pub fn is_terminal(self) -> bool {
        self.transitions().is_empty()
    }
}
