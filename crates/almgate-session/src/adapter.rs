//! Tool adapter seam.
//!
//! One async method per tool kind. Transport, auth, and timeouts live behind
//! this trait; the executor only sees typed results or an [`AdapterFailure`].

use almgate_kernel::{ChangePayload, ItemAction, RemoteId};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Wait assumed when a rate-limit signal carries no seconds.
pub const DEFAULT_RATE_LIMIT_SECONDS: u64 = 30;

/// A project or tracker reported by a discovery tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredEntity {
    pub id: RemoteId,
    pub name: String,
    /// Owning project, for trackers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RemoteId>,
}

/// One item row returned by a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: RemoteId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<RemoteId>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryPage {
    pub items: Vec<ItemRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationDirection {
    Upstream,
    Downstream,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationEdge {
    pub from: RemoteId,
    pub to: RemoteId,
    pub direction: RelationDirection,
    /// Remote link type, e.g. `hasLinkTo` or `hasParent`.
    pub relation: String,
}

/// Relation graph fragment around a set of items.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelationGraph {
    pub edges: Vec<RelationEdge>,
}

/// Per-item outcome of a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item: RemoteId,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ItemOutcome {
    pub fn ok(item: RemoteId) -> Self {
        Self {
            item,
            ok: true,
            message: None,
        }
    }

    pub fn failed(item: RemoteId, message: impl Into<String>) -> Self {
        Self {
            item,
            ok: false,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterFailure {
    /// The remote asked us to stop for `seconds`.
    #[error("RATE_LIMITED:{seconds}")]
    RateLimited { seconds: u64 },

    /// The remote rejected the CBQL.
    #[error("INVALID_CBQL: {message}")]
    InvalidQuery { message: String },

    #[error("{message}")]
    Remote { message: String },

    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

fn rate_limited_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*RATE_LIMITED(?:\s*:\s*(\d+))?").expect("rate-limit regex must compile")
    })
}

fn invalid_cbql_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*INVALID_CBQL(?:\s*:\s*(.*))?$").expect("invalid-cbql regex must compile")
    })
}

fn timeout_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*TIMEOUT(?:\s*:\s*(\d+))?").expect("timeout regex must compile")
    })
}

impl AdapterFailure {
    /// Classify a raw error string from a tool.
    ///
    /// `RATE_LIMITED:<seconds>`, `INVALID_CBQL[:<msg>]` and
    /// `TIMEOUT[:<seconds>]` are sentinels; everything else is a remote
    /// failure carried verbatim.
    pub fn from_message(message: &str) -> Self {
        if let Some(caps) = rate_limited_re().captures(message) {
            let seconds = caps
                .get(1)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(DEFAULT_RATE_LIMIT_SECONDS);
            return Self::RateLimited { seconds };
        }
        if let Some(caps) = invalid_cbql_re().captures(message) {
            let detail = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            return Self::InvalidQuery {
                message: if detail.is_empty() {
                    "query rejected by remote".to_string()
                } else {
                    detail.to_string()
                },
            };
        }
        if let Some(caps) = timeout_re().captures(message) {
            let seconds = caps
                .get(1)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or_default();
            return Self::Timeout { seconds };
        }
        Self::Remote {
            message: message.to_string(),
        }
    }
}

pub type AdapterResult<T> = Result<T, AdapterFailure>;

/// The remote ALM system, one method per tool kind.
///
/// Implementations must not retry. A rate limit is reported as
/// [`AdapterFailure::RateLimited`] and nothing else.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn discover_projects(&self) -> AdapterResult<Vec<DiscoveredEntity>>;

    async fn discover_trackers(&self, project: RemoteId) -> AdapterResult<Vec<DiscoveredEntity>>;

    /// One page of a query. Pages are 1-based; a page shorter than
    /// `page_size` is the last.
    async fn query_page(&self, cbql: &str, page: u32, page_size: u32) -> AdapterResult<QueryPage>;

    async fn expand_relations(&self, items: &[RemoteId]) -> AdapterResult<RelationGraph>;

    async fn bulk_update(
        &self,
        items: &[RemoteId],
        payload: &ChangePayload,
        atomic: bool,
    ) -> AdapterResult<Vec<ItemOutcome>>;

    async fn item_action(&self, item: RemoteId, action: &ItemAction) -> AdapterResult<ItemOutcome>;
}
