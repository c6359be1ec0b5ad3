use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type FeedId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    /// Throughput counting against a running total.
    Counter,
    /// Parking-style slot tracking.
    Multicam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Active,
    #[default]
    Inactive,
}

/// One feed record. Field names follow the JSON written by the config UI;
/// anything this service does not know about is carried in `extra` so a
/// rewrite never drops it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: FeedId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FeedKind,
    #[serde(rename = "video_source")]
    pub source: String,
    #[serde(default)]
    pub status: FeedStatus,
    #[serde(rename = "lineY", default, skip_serializing_if = "Option::is_none")]
    pub line_y: Option<f32>,
    #[serde(default)]
    pub count: i64,
    #[serde(rename = "totalSlots", default)]
    pub total_slots: u32,
    #[serde(rename = "availableSlots", default)]
    pub available_slots: u32,
    #[serde(
        rename = "compensateOnDisappear",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub compensate_on_disappear: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Feed {
    pub fn is_active(&self) -> bool {
        self.status == FeedStatus::Active
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("feed-{}", self.id)
        } else {
            self.name.clone()
        }
    }

    /// Whether a deregistered identity reverts its last counted crossing.
    /// Off unless the feed opts in: a vehicle leaving the view after
    /// crossing has still entered (or left) the lot.
    pub fn compensates_on_disappear(&self) -> bool {
        self.compensate_on_disappear.unwrap_or(false)
    }

    /// Resolves the source locator. URLs, device paths and absolute paths are
    /// used as-is, a bare number selects `/dev/videoN`, anything else is taken
    /// relative to `base` (the feed document's directory).
    pub fn resolve_source(&self, base: &Path) -> String {
        let source = self.source.trim();
        if source.contains("://") || Path::new(source).is_absolute() {
            return source.to_string();
        }
        if !source.is_empty() && source.chars().all(|c| c.is_ascii_digit()) {
            return format!("/dev/video{source}");
        }
        base.join(source).to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedDocument {
    #[serde(default)]
    pub feeds: Vec<Feed>,
    #[serde(default)]
    pub global_car_count: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FeedDocument {
    pub fn feed(&self, id: FeedId) -> Option<&Feed> {
        self.feeds.iter().find(|f| f.id == id)
    }

    pub fn feed_mut(&mut self, id: FeedId) -> Option<&mut Feed> {
        self.feeds.iter_mut().find(|f| f.id == id)
    }

    pub fn active_feeds(&self) -> impl Iterator<Item = &Feed> {
        self.feeds.iter().filter(|f| f.is_active())
    }
}
