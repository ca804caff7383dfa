//! Endpoint resolution and remote-document parsing for talkfeed.

use serde::Deserialize;
use talkfeed_core::{Config, EnclosureInfo, EventConfig, PodcastEntry, TalkCandidate};
use talkfeed_store::{FetchCache, ProbeOutcome};
use thiserror::Error;

pub const CRATE_NAME: &str = "talkfeed-schedule";

/// First congress year using the current URL conventions. 36c3 (2019) was
/// the last congress on the legacy layout; the pandemic years have no
/// congress, so everything from 2020 on resolves as current.
pub const CURRENT_ERA_FIRST_YEAR: i32 = 2020;

/// Year from which the schedule file moved under a nested `schedules/`
/// path segment.
const NESTED_SCHEDULE_FIRST_YEAR: i32 = 2025;

/// URL naming convention in effect for an event year. Selected once by the
/// resolver; everything downstream consumes the enum instead of re-deriving
/// the era from the year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlConvention {
    /// Capitalized `Fahrplan` path segment, standard-quality podcast file.
    Legacy,
    /// Lowercase `fahrplan` path segment, high-quality podcast file.
    Current,
}

impl UrlConvention {
    pub fn for_year(year: i32) -> Self {
        if year >= CURRENT_ERA_FIRST_YEAR {
            UrlConvention::Current
        } else {
            UrlConvention::Legacy
        }
    }
}

/// Endpoint set generated for an unconfigured year. Schedule candidates are
/// ordered newest pattern first; the caller probes them and keeps the first
/// reachable one.
#[derive(Debug, Clone)]
pub struct GeneratedEndpoints {
    pub event_id: String,
    pub convention: UrlConvention,
    pub schedule_candidates: Vec<String>,
    pub podcast_url: String,
    pub event_pattern_head: String,
    pub event_pattern_tail: String,
}

pub fn generate_endpoints(year: i32, congress_number: u32) -> GeneratedEndpoints {
    let convention = UrlConvention::for_year(year);
    let event_id = format!("{congress_number}c3");

    let (schedule_candidates, podcast_url, event_pattern_head) = match convention {
        UrlConvention::Current => {
            let mut candidates = Vec::new();
            if year >= NESTED_SCHEDULE_FIRST_YEAR {
                candidates.push(format!(
                    "https://fahrplan.events.ccc.de/congress/{year}/fahrplan/schedules/schedule.xml"
                ));
            }
            candidates.push(format!(
                "https://pretalx.c3voc.de/{event_id}/schedule/export/schedule.xml"
            ));
            candidates.push(format!(
                "https://fahrplan.events.ccc.de/congress/{year}/fahrplan/schedule.xml"
            ));
            (
                candidates,
                format!("https://media.ccc.de/c/{event_id}/podcast/mp4-hq.xml"),
                format!("https://fahrplan.events.ccc.de/congress/{year}/fahrplan/events/"),
            )
        }
        UrlConvention::Legacy => (
            vec![format!(
                "https://fahrplan.events.ccc.de/congress/{year}/Fahrplan/schedule.xml"
            )],
            format!("https://media.ccc.de/c/{event_id}/podcast/mp4.xml"),
            format!("https://fahrplan.events.ccc.de/congress/{year}/Fahrplan/events/"),
        ),
    };

    GeneratedEndpoints {
        event_id,
        convention,
        schedule_candidates,
        podcast_url,
        event_pattern_head,
        event_pattern_tail: ".html".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unresolvable event identifier '{0}'")]
    UnresolvableEvent(String),
}

#[derive(Debug, Clone)]
pub struct ResolvedEvent {
    pub key: String,
    pub config: EventConfig,
    /// True when the config was generated rather than read from the
    /// configuration document; callers decide whether to persist it.
    pub generated: bool,
}

/// Congress ordinal for a year: offset from the latest configured event when
/// a configuration exists, otherwise the era formula.
pub fn congress_number(config: &Config, year: i32) -> u32 {
    config
        .congress_number_for_year(year)
        .unwrap_or_else(|_| era_congress_number(year))
}

fn era_congress_number(year: i32) -> u32 {
    let base = match UrlConvention::for_year(year) {
        UrlConvention::Current => 1986,
        UrlConvention::Legacy => 1983,
    };
    (year - base).max(1) as u32
}

/// Resolve an event identifier (configured id or year-like token) to an
/// EventConfig. Generated configs use the newest schedule pattern for the
/// year's era; `choose_schedule_url` refines that choice by probing.
pub fn resolve_event(config: &Config, identifier: &str) -> Result<ResolvedEvent, ResolveError> {
    if let Some(event) = config.events.get(identifier) {
        return Ok(ResolvedEvent {
            key: identifier.to_string(),
            config: event.clone(),
            generated: false,
        });
    }

    let year: i32 = identifier
        .parse()
        .ok()
        .filter(|y| (1984..=9999).contains(y))
        .ok_or_else(|| ResolveError::UnresolvableEvent(identifier.to_string()))?;

    if let Some((key, event)) = config.event_by_year(year) {
        return Ok(ResolvedEvent {
            key: key.to_string(),
            config: event.clone(),
            generated: false,
        });
    }

    let ordinal = congress_number(config, year);
    let endpoints = generate_endpoints(year, ordinal);
    Ok(ResolvedEvent {
        key: endpoints.event_id.clone(),
        config: EventConfig {
            year,
            congress_number: ordinal,
            fahrplan_url: endpoints.schedule_candidates[0].clone(),
            media_feed_url: endpoints.podcast_url,
            event_pattern_head: Some(endpoints.event_pattern_head),
            event_pattern_tail: Some(endpoints.event_pattern_tail),
        },
        generated: true,
    })
}

/// Probe the generated schedule candidates in order and pick the first
/// reachable one (or the newest pattern when none respond). Every probe
/// outcome is returned so the caller can report failures without treating
/// them as fatal.
pub async fn choose_schedule_url(
    cache: &FetchCache,
    endpoints: &GeneratedEndpoints,
) -> (String, Vec<ProbeOutcome>) {
    let mut outcomes = Vec::with_capacity(endpoints.schedule_candidates.len());
    let mut chosen = None;
    for url in &endpoints.schedule_candidates {
        let outcome = cache.probe(url).await;
        if outcome.ok && chosen.is_none() {
            chosen = Some(url.clone());
        }
        outcomes.push(outcome);
    }
    (
        chosen.unwrap_or_else(|| endpoints.schedule_candidates[0].clone()),
        outcomes,
    )
}

// Document parsing.

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed document: {0}")]
    Malformed(String),
}

fn root_name(bytes: &[u8]) -> Result<String, DocumentError> {
    let mut reader = quick_xml::Reader::from_reader(bytes);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(start)) => {
                return Ok(String::from_utf8_lossy(start.name().as_ref()).into_owned());
            }
            Ok(quick_xml::events::Event::Empty(start)) => {
                return Ok(String::from_utf8_lossy(start.name().as_ref()).into_owned());
            }
            Ok(quick_xml::events::Event::Eof) => {
                return Err(DocumentError::Malformed("empty document".into()));
            }
            Ok(_) => {}
            Err(err) => return Err(DocumentError::Malformed(err.to_string())),
        }
        buf.clear();
    }
}

#[derive(Debug, Deserialize)]
struct ScheduleDoc {
    #[serde(default, rename = "day")]
    days: Vec<DayNode>,
}

#[derive(Debug, Deserialize)]
struct DayNode {
    #[serde(default, rename = "room")]
    rooms: Vec<RoomNode>,
}

#[derive(Debug, Deserialize)]
struct RoomNode {
    #[serde(default, rename = "event")]
    events: Vec<EventNode>,
}

#[derive(Debug, Deserialize)]
struct EventNode {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@guid")]
    guid: Option<String>,
    title: Option<String>,
    subtitle: Option<String>,
    track: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    description: Option<String>,
    url: Option<String>,
    persons: Option<PersonsNode>,
}

#[derive(Debug, Deserialize)]
struct PersonsNode {
    #[serde(default, rename = "person")]
    entries: Vec<PersonNode>,
}

#[derive(Debug, Deserialize)]
struct PersonNode {
    #[serde(rename = "$text")]
    name: Option<String>,
}

/// Flatten a schedule document (day -> room -> event) into candidates in
/// document order. Zero events is a valid empty sequence, not an error.
pub fn parse_schedule(bytes: &[u8]) -> Result<Vec<TalkCandidate>, DocumentError> {
    let root = root_name(bytes)?;
    if root != "schedule" {
        return Err(DocumentError::Malformed(format!(
            "expected <schedule> root, found <{root}>"
        )));
    }

    let text = String::from_utf8_lossy(bytes);
    let doc: ScheduleDoc =
        quick_xml::de::from_str(&text).map_err(|err| DocumentError::Malformed(err.to_string()))?;

    let mut candidates = Vec::new();
    for day in doc.days {
        for room in day.rooms {
            for event in room.events {
                let title = match event.title {
                    Some(t) if !t.trim().is_empty() => t,
                    _ => continue,
                };
                let speakers = event
                    .persons
                    .map(|p| {
                        p.entries
                            .into_iter()
                            .filter_map(|person| person.name)
                            .map(|name| name.trim().to_string())
                            .filter(|name| !name.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                candidates.push(TalkCandidate {
                    id: event.id,
                    guid: event.guid,
                    title,
                    speakers,
                    track: event.track.filter(|t| !t.trim().is_empty()),
                    subtitle: event.subtitle.filter(|s| !s.trim().is_empty()),
                    abstract_text: event.abstract_text.filter(|a| !a.trim().is_empty()),
                    description: event.description.filter(|d| !d.trim().is_empty()),
                    url: event.url.filter(|u| !u.trim().is_empty()),
                });
            }
        }
    }
    Ok(candidates)
}

#[derive(Debug, Deserialize)]
struct RssDoc {
    channel: Option<ChannelNode>,
}

#[derive(Debug, Deserialize)]
struct ChannelNode {
    #[serde(default, rename = "item")]
    items: Vec<ItemNode>,
}

#[derive(Debug, Deserialize)]
struct ItemNode {
    title: Option<String>,
    guid: Option<GuidNode>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    enclosure: Option<EnclosureNode>,
}

#[derive(Debug, Deserialize)]
struct GuidNode {
    #[serde(rename = "$text")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnclosureNode {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "@type")]
    mime_type: Option<String>,
    #[serde(rename = "@length")]
    length: Option<String>,
}

/// Flatten a podcast document into enclosure-bearing entries in document
/// order. Items without a title cannot be correlated and are skipped.
pub fn parse_podcast(bytes: &[u8]) -> Result<Vec<PodcastEntry>, DocumentError> {
    let root = root_name(bytes)?;
    if root != "rss" {
        return Err(DocumentError::Malformed(format!(
            "expected <rss> root, found <{root}>"
        )));
    }

    let text = String::from_utf8_lossy(bytes);
    let doc: RssDoc =
        quick_xml::de::from_str(&text).map_err(|err| DocumentError::Malformed(err.to_string()))?;
    let channel = doc
        .channel
        .ok_or_else(|| DocumentError::Malformed("missing <channel> element".into()))?;

    let mut entries = Vec::new();
    for item in channel.items {
        let title = match item.title {
            Some(t) if !t.trim().is_empty() => t,
            _ => continue,
        };
        entries.push(PodcastEntry {
            title,
            guid: item.guid.and_then(|g| g.value),
            published: item.pub_date,
            description: item.description,
            enclosure: item.enclosure.map(|e| EnclosureInfo {
                url: e.url.unwrap_or_default(),
                mime_type: e.mime_type.unwrap_or_default(),
                length: e.length.unwrap_or_default(),
            }),
        });
    }
    Ok(entries)
}
