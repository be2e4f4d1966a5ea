//! Claim timelines.
//!
//! Each claim carries an append-only list of events describing how the
//! claim has appeared and changed across sources over time. Events are
//! stored in arrival order inside `claims.timeline_json`; chronological
//! order is recomputed on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Multiplier applied to a retracted claim's confidence on read.
/// The stored confidence is preserved for audit.
pub const RETRACTION_CONFIDENCE_PENALTY: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    FirstAppeared,
    Updated,
    Corrected,
    Retracted,
    Confirmed,
}

impl TimelineEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstAppeared => "first_appeared",
            Self::Updated => "updated",
            Self::Corrected => "corrected",
            Self::Retracted => "retracted",
            Self::Confirmed => "confirmed",
        }
    }
}

/// One append-only record of how a claim appeared or changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: TimelineEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wayback_snapshot_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TimelineEvent {
    pub fn new(event_type: TimelineEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            source_url: None,
            wayback_snapshot_url: None,
            notes: None,
        }
    }

    pub fn with_source(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// A claim's event history plus derived properties.
#[derive(Debug, Clone, Default)]
pub struct ClaimTimeline {
    events: Vec<TimelineEvent>,
}

impl ClaimTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode from the stored JSON column. An empty or missing column is an
    /// empty timeline, not an error.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        let events: Vec<TimelineEvent> = serde_json::from_str(json)?;
        Ok(Self { events })
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&self.events)?)
    }

    /// Events are appended in arrival order; storage order is preserved.
    pub fn append(&mut self, event: TimelineEvent) {
        self.events.push(event);
    }

    /// Events in chronological order (recomputed, storage untouched).
    pub fn chronological(&self) -> Vec<&TimelineEvent> {
        let mut sorted: Vec<&TimelineEvent> = self.events.iter().collect();
        sorted.sort_by_key(|e| e.timestamp);
        sorted
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn has_timeline(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn is_retracted(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.event_type == TimelineEventType::Retracted)
    }

    pub fn is_corrected(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.event_type == TimelineEventType::Corrected)
    }

    pub fn confirmation_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == TimelineEventType::Confirmed)
            .count()
    }

    /// Confidence as readers should see it. The stored score is never
    /// rewritten; retraction discounts it here.
    pub fn effective_confidence(&self, stored_confidence: f64) -> f64 {
        if self.is_retracted() {
            stored_confidence * RETRACTION_CONFIDENCE_PENALTY
        } else {
            stored_confidence
        }
    }
}
