//! Core domain model and record validation for talkfeed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "talkfeed-core";

/// Remote endpoints and link pattern for one congress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    pub year: i32,
    pub congress_number: u32,
    pub fahrplan_url: String,
    pub media_feed_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_pattern_head: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_pattern_tail: Option<String>,
}

impl EventConfig {
    /// Reconstruct the talk web URL from the configured link pattern.
    /// Returns None when no pattern is configured; candidates carrying their
    /// own `<url>` element take precedence over this at merge time.
    pub fn talk_url(&self, event_id: &str) -> Option<String> {
        match (&self.event_pattern_head, &self.event_pattern_tail) {
            (Some(head), Some(tail)) => Some(format!("{head}{event_id}{tail}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Channel-level defaults applied to every rendered feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Output category -> tracks mapped onto it. The `_default` key holds
    /// the fallback categories for unmapped tracks.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub category_mapping: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub events: BTreeMap<String, EventConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no events configured")]
    NoEvents,
    #[error("event '{0}': event_pattern_head and event_pattern_tail must be provided together")]
    HalfPattern(String),
}

impl Config {
    /// Structural checks beyond what typed deserialization already enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, event) in &self.events {
            if event.event_pattern_head.is_some() != event.event_pattern_tail.is_some() {
                return Err(ConfigError::HalfPattern(key.clone()));
            }
        }
        Ok(())
    }

    pub fn event_by_year(&self, year: i32) -> Option<(&str, &EventConfig)> {
        self.events
            .iter()
            .find(|(_, e)| e.year == year)
            .map(|(k, e)| (k.as_str(), e))
    }

    pub fn latest_event(&self) -> Result<(&str, &EventConfig), ConfigError> {
        self.events
            .iter()
            .max_by_key(|(_, e)| e.year)
            .map(|(k, e)| (k.as_str(), e))
            .ok_or(ConfigError::NoEvents)
    }

    /// Congress ordinal for a year, offset from the most recent configured
    /// event. Assumes annual congresses relative to that reference point, so
    /// gap years already encoded in the config are respected.
    pub fn congress_number_for_year(&self, year: i32) -> Result<u32, ConfigError> {
        let (_, latest) = self.latest_event()?;
        let offset = year - latest.year;
        Ok((latest.congress_number as i64 + offset as i64).max(1) as u32)
    }
}

/// Channel metadata of one record file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMeta {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// A single collaborative feedback entry. At least one of rating/comment
/// must be present; rating-less entries are comment-only contributions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// A persisted, curated talk entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalkRecord {
    pub title: String,
    #[serde(default)]
    pub published: String,
    #[serde(default)]
    pub speakers: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub media_url: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub media_length: String,
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<Feedback>,
}

/// On-disk record file: one channel worth of curated talks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFile {
    pub meta: FeedMeta,
    #[serde(default)]
    pub feed: Vec<TalkRecord>,
}

/// Talk entry parsed from a schedule document; transient within one
/// discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TalkCandidate {
    pub id: Option<String>,
    pub guid: Option<String>,
    pub title: String,
    pub speakers: Vec<String>,
    pub track: Option<String>,
    pub subtitle: Option<String>,
    pub abstract_text: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
}

/// Media-file reference attached to a podcast item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnclosureInfo {
    pub url: String,
    pub mime_type: String,
    pub length: String,
}

/// Podcast item flattened out of the media feed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodcastEntry {
    pub title: String,
    pub guid: Option<String>,
    pub published: Option<String>,
    pub description: Option<String>,
    pub enclosure: Option<EnclosureInfo>,
}

/// Validation outcome for one record file. Errors block rendering for that
/// file; warnings ride alongside successful output.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Check a record file against the data-model invariants.
pub fn validate_record_file(file: &RecordFile) -> ValidationReport {
    let mut report = ValidationReport::default();

    for (idx, record) in file.feed.iter().enumerate() {
        let label = if record.title.trim().is_empty() {
            format!("item {}", idx + 1)
        } else {
            format!("'{}'", record.title)
        };

        if record.title.trim().is_empty() {
            report.add_error(format!("Talk {label} is missing a title"));
        }
        if record.categories.is_empty() {
            report.add_warning(format!("Talk {label} is missing categories"));
        }
        if record.feedback.is_empty() {
            report.add_warning(format!("Talk {label} has no feedback"));
        }

        for (fb_idx, fb) in record.feedback.iter().enumerate() {
            let who = fb.username.as_deref().unwrap_or("Anonymous");
            match fb.rating {
                Some(r) if !(1..=5).contains(&r) => {
                    report.add_error(format!(
                        "Talk {label}: feedback #{} (by {who}) has rating {r} outside 1-5",
                        fb_idx + 1
                    ));
                }
                None if fb.comment.as_deref().map_or(true, |c| c.trim().is_empty()) => {
                    report.add_error(format!(
                        "Talk {label}: feedback #{} (by {who}) has neither rating nor comment",
                        fb_idx + 1
                    ));
                }
                _ => {}
            }
        }
    }

    report
}
