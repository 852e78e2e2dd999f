//! The routing error taxonomy and its HTTP mapping.
//!
//! [`RouteError`] is what every public routing operation returns on failure.
//! Variants that arise after candidate selection carry the [`RouteDecision`]
//! so callers can reconstruct which nodes were tried and why — the decision
//! is embedded in HTTP error bodies too.
//!
//! Implementing [`IntoResponse`] directly on the error means every handler
//! can return `Result<T, RouteError>` and propagate with `?` — no manual
//! `map_err`, no boilerplate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::router::RouteDecision;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No node could be contacted: empty registry, nothing eligible, an
    /// unavailable pinned node, or every attempt bounced off a dead address.
    #[error("no node could be contacted ({decision})")]
    NodeUnreachable { decision: RouteDecision },

    /// The scheduler's waiting queue is past its soft cap.
    #[error("router overloaded, try again later")]
    Overloaded,

    #[error("request canceled by caller")]
    Canceled,

    /// The caller's total budget ran out, waiting or mid-attempt.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The sole attempt exceeded its per-attempt timeout.
    #[error("backend attempt timed out ({decision})")]
    Timeout { decision: RouteDecision },

    /// The backend rejected the request itself; never retried.
    #[error("backend rejected the request with HTTP {status} ({decision})")]
    BadRequest {
        status: u16,
        body: String,
        decision: RouteDecision,
    },

    /// The sole attempt produced undecodable output.
    #[error("malformed backend response ({decision})")]
    MalformedResponse { decision: RouteDecision },

    /// Every candidate attempt failed; the decision lists each failure.
    #[error("all candidate nodes failed ({decision})")]
    AllCandidatesFailed { decision: RouteDecision },

    /// Every model in the fallback chain failed on every candidate.
    #[error("fallback chain exhausted ({decision})")]
    FallbackExhausted { decision: RouteDecision },
}

impl RouteError {
    /// Stable machine-readable tag for API bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeUnreachable { .. } => "node_unreachable",
            Self::Overloaded => "overloaded",
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Timeout { .. } => "timeout",
            Self::BadRequest { .. } => "bad_request",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::AllCandidatesFailed { .. } => "all_candidates_failed",
            Self::FallbackExhausted { .. } => "fallback_exhausted",
        }
    }

    /// The routing decision, for variants that got far enough to have one.
    pub fn decision(&self) -> Option<&RouteDecision> {
        match self {
            Self::NodeUnreachable { decision }
            | Self::Timeout { decision }
            | Self::BadRequest { decision, .. }
            | Self::MalformedResponse { decision }
            | Self::AllCandidatesFailed { decision }
            | Self::FallbackExhausted { decision } => Some(decision),
            Self::Overloaded | Self::Canceled | Self::DeadlineExceeded => None,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NodeUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            Self::Canceled => StatusCode::REQUEST_TIMEOUT,
            Self::DeadlineExceeded | Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BadRequest { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::MalformedResponse { .. }
            | Self::AllCandidatesFailed { .. }
            | Self::FallbackExhausted { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        tracing::warn!(kind = self.kind(), error = %self, "request failed");
        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
                "decision": self.decision(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}
