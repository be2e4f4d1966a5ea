//! Domain models for the evidence graph.
//!
//! Entities:
//! - `Task` owns queries and claims (cascade delete within a task)
//! - `Page` is global, deduplicated by URL hash; task linkage is inferred
//!   through serp_items -> queries -> tasks
//! - `Edge` is a typed directed relation forming a heterogeneous graph
//! - `Job` is a scheduled unit of work in one of four kinds

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// TASK
// ============================================================================

/// Lifecycle status of a research task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Exploring,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Exploring => "exploring",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Queuing new work is allowed in every non-failed state; queuing onto
    /// created/paused tasks flips them to exploring.
    pub fn accepts_jobs(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "exploring" => Ok(Self::Exploring),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub hypothesis: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
}

// ============================================================================
// QUERY / SERP
// ============================================================================

/// Advisory query category used for engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryCategory {
    Academic,
    News,
    Government,
    Technical,
    General,
}

impl QueryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Academic => "academic",
            Self::News => "news",
            Self::Government => "government",
            Self::Technical => "technical",
            Self::General => "general",
        }
    }
}

impl std::str::FromStr for QueryCategory {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "academic" => Ok(Self::Academic),
            "news" => Ok(Self::News),
            "government" => Ok(Self::Government),
            "technical" => Ok(Self::Technical),
            "general" => Ok(Self::General),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for QueryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An executed search query. Immutable once inserted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchQuery {
    pub id: String,
    pub task_id: String,
    pub query_text: String,
    pub normalized_text: String,
    pub category: QueryCategory,
    pub engine: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Coarse classification of a result's origin, used by report materials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Government,
    Academic,
    News,
    Technical,
    Blog,
    Knowledge,
    Standards,
    Unknown,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Government => "government",
            Self::Academic => "academic",
            Self::News => "news",
            Self::Technical => "technical",
            Self::Blog => "blog",
            Self::Knowledge => "knowledge",
            Self::Standards => "standards",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for SourceTag {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "government" => Ok(Self::Government),
            "academic" => Ok(Self::Academic),
            "news" => Ok(Self::News),
            "technical" => Ok(Self::Technical),
            "blog" => Ok(Self::Blog),
            "knowledge" => Ok(Self::Knowledge),
            "standards" => Ok(Self::Standards),
            _ => Ok(Self::Unknown),
        }
    }
}

/// One ranked result row from a search engine response.
#[derive(Debug, Clone, Serialize)]
pub struct SerpItem {
    pub query_id: String,
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub source_tag: SourceTag,
    pub rank: i64,
}

// ============================================================================
// PAGE / FRAGMENT
// ============================================================================

/// A fetched page. Task-independent; deduplicated globally by URL.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub domain: String,
    pub html_path: Option<String>,
    pub canonical_id: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// A selected passage from a page, scored for relevance.
#[derive(Debug, Clone, Serialize)]
pub struct Fragment {
    pub id: String,
    pub page_id: String,
    pub text_content: String,
    pub heading_context: Option<String>,
    pub rerank_score: f64,
    pub is_relevant: bool,
}

// ============================================================================
// CLAIM
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimPolarity {
    Positive,
    Negative,
    Neutral,
}

impl ClaimPolarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
        }
    }
}

impl std::str::FromStr for ClaimPolarity {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "neutral" => Ok(Self::Neutral),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimGranularity {
    Atomic,
    Composite,
    Meta,
}

impl ClaimGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Composite => "composite",
            Self::Meta => "meta",
        }
    }
}

impl std::str::FromStr for ClaimGranularity {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atomic" => Ok(Self::Atomic),
            "composite" => Ok(Self::Composite),
            "meta" => Ok(Self::Meta),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimType {
    Factual,
    Causal,
    Comparative,
    Definitional,
    Temporal,
    Quantitative,
}

impl ClaimType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Factual => "factual",
            Self::Causal => "causal",
            Self::Comparative => "comparative",
            Self::Definitional => "definitional",
            Self::Temporal => "temporal",
            Self::Quantitative => "quantitative",
        }
    }
}

impl std::str::FromStr for ClaimType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "factual" => Ok(Self::Factual),
            "causal" => Ok(Self::Causal),
            "comparative" => Ok(Self::Comparative),
            "definitional" => Ok(Self::Definitional),
            "temporal" => Ok(Self::Temporal),
            "quantitative" => Ok(Self::Quantitative),
            _ => Err(()),
        }
    }
}

/// A verifiable claim extracted from a research question.
#[derive(Debug, Clone, Serialize)]
pub struct Claim {
    pub id: String,
    pub task_id: String,
    pub claim_text: String,
    pub claim_type: ClaimType,
    pub expected_polarity: ClaimPolarity,
    pub granularity: ClaimGranularity,
    pub parent_claim_id: Option<String>,
    pub source_question: String,
    pub keywords: Vec<String>,
    pub verification_hints: Vec<String>,
    /// Stored confidence. Retraction penalties apply on read, never here.
    pub confidence_score: f64,
    pub timeline_json: String,
    pub is_verified: bool,
    pub rejected: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// EDGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeRelation {
    Supports,
    Refutes,
    Cites,
    Extracts,
}

impl EdgeRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supports => "supports",
            Self::Refutes => "refutes",
            Self::Cites => "cites",
            Self::Extracts => "extracts",
        }
    }
}

impl std::str::FromStr for EdgeRelation {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supports" => Ok(Self::Supports),
            "refutes" => Ok(Self::Refutes),
            "cites" => Ok(Self::Cites),
            "extracts" => Ok(Self::Extracts),
            _ => Err(()),
        }
    }
}

/// Node kinds addressable by edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Page,
    Fragment,
    Claim,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Fragment => "fragment",
            Self::Claim => "claim",
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page" => Ok(Self::Page),
            "fragment" => Ok(Self::Fragment),
            "claim" => Ok(Self::Claim),
            _ => Err(()),
        }
    }
}

/// Typed directed relation between graph nodes. No self-loops.
#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub id: String,
    pub source_type: NodeType,
    pub source_id: String,
    pub target_type: NodeType,
    pub target_id: String,
    pub relation: EdgeRelation,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// JOB
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SearchQueue,
    TargetQueue,
    VerifyNli,
    CitationGraph,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchQueue => "search_queue",
            Self::TargetQueue => "target_queue",
            Self::VerifyNli => "verify_nli",
            Self::CitationGraph => "citation_graph",
        }
    }

    /// The slot a job of this kind executes in.
    pub fn slot(&self) -> &'static str {
        match self {
            Self::SearchQueue | Self::TargetQueue | Self::CitationGraph => "network_client",
            Self::VerifyNli => "nli",
        }
    }

    /// Job id prefix, short enough to read in logs.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::SearchQueue => "s",
            Self::TargetQueue => "tg",
            Self::VerifyNli => "vn",
            Self::CitationGraph => "cg",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search_queue" => Ok(Self::SearchQueue),
            "target_queue" => Ok(Self::TargetQueue),
            "verify_nli" => Ok(Self::VerifyNli),
            "citation_graph" => Ok(Self::CitationGraph),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job state. Advances monotonically: queued -> running -> done | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::str::FromStr for JobState {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub task_id: String,
    pub kind: JobKind,
    pub priority: i64,
    pub slot: String,
    pub state: JobState,
    pub input: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cause_id: Option<String>,
    pub error: Option<String>,
}

// ============================================================================
// ENGINE HEALTH
// ============================================================================

/// Persisted health row for one engine, mirrored by its circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub engine: String,
    pub status: String,
    pub success_rate_1h: f64,
    pub success_rate_24h: f64,
    pub captcha_rate: f64,
    pub median_latency_ms: f64,
    pub consecutive_failures: i64,
    pub total_failures_in_window: i64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

// ============================================================================
// HELPERS
// ============================================================================

/// Registrable domain of a URL (eTLD+1 against a compact second-level list).
pub fn registrable_domain(url: &url::Url) -> String {
    const SECOND_LEVEL: &[&str] = &[
        "co.jp", "go.jp", "ne.jp", "or.jp", "ac.jp", "co.uk", "gov.uk", "ac.uk", "org.uk",
        "com.au", "gov.au", "co.nz", "com.br", "co.kr", "co.in",
    ];

    let Some(host) = url.host_str() else {
        return String::new();
    };
    let host = host.trim_start_matches("www.");
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host.to_string();
    }

    let last_two = labels[labels.len() - 2..].join(".");
    if SECOND_LEVEL.contains(&last_two.as_str()) {
        labels[labels.len() - 3..].join(".")
    } else {
        last_two
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn task_status_round_trips() {
        for s in ["created", "exploring", "paused", "completed", "failed"] {
            assert_eq!(TaskStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(TaskStatus::from_str("bogus").is_err());
    }

    #[test]
    fn failed_is_terminal_and_rejects_jobs() {
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Failed.accepts_jobs());
        assert!(TaskStatus::Paused.accepts_jobs());
    }

    #[test]
    fn job_kind_maps_to_slot() {
        assert_eq!(JobKind::SearchQueue.slot(), "network_client");
        assert_eq!(JobKind::VerifyNli.slot(), "nli");
        assert_eq!(JobKind::from_str("citation_graph").unwrap(), JobKind::CitationGraph);
    }

    #[test]
    fn registrable_domain_handles_second_level_tlds() {
        let u = url::Url::parse("https://www.soumu.go.jp/some/page").unwrap();
        assert_eq!(registrable_domain(&u), "soumu.go.jp");

        let u = url::Url::parse("https://blog.example.com/x").unwrap();
        assert_eq!(registrable_domain(&u), "example.com");

        let u = url::Url::parse("https://openai.com/index").unwrap();
        assert_eq!(registrable_domain(&u), "openai.com");
    }

    #[test]
    fn source_tag_parse_defaults_to_unknown() {
        assert_eq!(SourceTag::from_str("weird").unwrap(), SourceTag::Unknown);
        assert_eq!(SourceTag::from_str("academic").unwrap(), SourceTag::Academic);
    }
}
