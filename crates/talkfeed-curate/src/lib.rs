//! Talk matching, rating aggregation, feed filtering and rendering.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use strsim::jaro_winkler;
use talkfeed_core::{
    validate_record_file, EventConfig, FeedMeta, Feedback, GlobalConfig, PodcastEntry, RecordFile,
    TalkCandidate, TalkRecord, ValidationReport,
};
use talkfeed_store::{FetchCache, Provenance};
use thiserror::Error;

pub const CRATE_NAME: &str = "talkfeed-curate";

/// Records with a mean at or below this are excluded unless the caller asks
/// for all ratings. The comparison always uses the unrounded mean.
pub const RATING_THRESHOLD: f64 = 2.0;

/// Minimum Jaro-Winkler similarity for the fuzzy level of schedule/podcast
/// title correlation.
pub const TITLE_SIMILARITY_THRESHOLD: f64 = 0.9;

const DEFAULT_CATEGORY_KEY: &str = "_default";
const SECTION_BAR_LEN: usize = 30;
const PUB_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

// Title normalization.

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize for query matching: trim, collapse whitespace, uppercase.
pub fn normalize(s: &str) -> String {
    collapse_whitespace(s).to_uppercase()
}

/// Podcast titles often carry a trailing event marker like `(36c3)` that the
/// schedule titles lack; strip it before correlating the two documents.
fn strip_event_suffix(s: &str) -> &str {
    let trimmed = s.trim_end();
    if let Some(body) = trimmed.strip_suffix(')') {
        if let Some(open) = body.rfind('(') {
            let inner = &body[open + 1..];
            let digits = inner
                .strip_suffix("c3")
                .or_else(|| inner.strip_suffix("C3"));
            if let Some(digits) = digits {
                if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                    return body[..open].trim_end();
                }
            }
        }
    }
    trimmed
}

fn normalize_for_correlation(s: &str) -> String {
    normalize(strip_event_suffix(s))
}

// Matcher.

/// Outcome of candidate selection for one query.
#[derive(Debug)]
pub enum Selection<'a> {
    One(&'a TalkCandidate),
    /// More than one survivor with an identical normalized title; callers
    /// must disambiguate, never pick silently.
    Ambiguous(Vec<&'a TalkCandidate>),
    None,
}

fn retain_if_any<T>(survivors: &mut Vec<T>, pred: impl Fn(&T) -> bool) {
    if survivors.iter().any(&pred) {
        survivors.retain(|item| pred(item));
    }
}

/// Pick the best candidate for a free-text query. Base match is containment
/// of the normalized query in the normalized title; ties break by exact
/// equality, then query-as-prefix, then shortest title, then first-seen
/// order. The chain is total and deterministic for a given input sequence.
pub fn select_candidate<'a>(query: &str, candidates: &'a [TalkCandidate]) -> Selection<'a> {
    let needle = normalize(query);
    if needle.is_empty() {
        return Selection::None;
    }

    let mut survivors: Vec<(usize, &TalkCandidate, String)> = candidates
        .iter()
        .enumerate()
        .map(|(idx, cand)| (idx, cand, normalize(&cand.title)))
        .filter(|(_, _, title)| title.contains(&needle))
        .collect();

    if survivors.is_empty() {
        return Selection::None;
    }

    retain_if_any(&mut survivors, |(_, _, title)| *title == needle);
    retain_if_any(&mut survivors, |(_, _, title)| title.starts_with(&needle));
    let shortest = survivors
        .iter()
        .map(|(_, _, title)| title.chars().count())
        .min()
        .expect("survivors is non-empty");
    survivors.retain(|(_, _, title)| title.chars().count() == shortest);

    // Survivors keep input order, so the front element is the first-seen
    // tie-break winner. A winner whose normalized title appears again among
    // the survivors cannot be picked silently.
    let (_, first, first_title) = &survivors[0];
    let twins: Vec<&TalkCandidate> = survivors
        .iter()
        .filter(|(_, _, title)| title == first_title)
        .map(|(_, cand, _)| *cand)
        .collect();
    if twins.len() > 1 {
        return Selection::Ambiguous(twins);
    }

    Selection::One(*first)
}

fn titles_correlate(schedule_title: &str, podcast_title: &str) -> bool {
    let a = normalize_for_correlation(schedule_title);
    let b = normalize_for_correlation(podcast_title);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    // The podcast feed sometimes drops subtitles, so check both directions.
    if a.contains(&b) || b.contains(&a) {
        return true;
    }
    jaro_winkler(&a, &b) >= TITLE_SIMILARITY_THRESHOLD
}

/// First podcast entry correlated to the candidate, by shared guid or by the
/// title ladder (exact, bidirectional substring, fuzzy).
pub fn correlate_entry<'a>(
    candidate: &TalkCandidate,
    entries: &'a [PodcastEntry],
) -> Option<&'a PodcastEntry> {
    if let Some(guid) = &candidate.guid {
        if let Some(entry) = entries.iter().find(|e| e.guid.as_ref() == Some(guid)) {
            return Some(entry);
        }
    }
    entries
        .iter()
        .find(|entry| titles_correlate(&candidate.title, &entry.title))
}

/// Merge a schedule candidate with its correlated podcast entry into a
/// record. Missing enclosure data leaves the media fields empty, pending
/// manual completion.
pub fn merge_candidate(
    candidate: &TalkCandidate,
    entry: Option<&PodcastEntry>,
    event: &EventConfig,
    long_desc: bool,
) -> TalkRecord {
    let enclosure = entry.and_then(|e| e.enclosure.as_ref());

    let web_url = candidate
        .url
        .clone()
        .or_else(|| {
            candidate
                .id
                .as_deref()
                .and_then(|id| event.talk_url(id))
        })
        .unwrap_or_default();

    let description = if long_desc {
        candidate
            .description
            .clone()
            .or_else(|| candidate.abstract_text.clone())
            .unwrap_or_default()
    } else {
        entry
            .and_then(|e| e.description.clone())
            .unwrap_or_default()
    };

    TalkRecord {
        title: candidate.title.clone(),
        published: entry
            .and_then(|e| e.published.clone())
            .unwrap_or_default(),
        speakers: candidate.speakers.join(", "),
        subtitle: candidate.subtitle.clone().unwrap_or_default(),
        media_url: enclosure.map(|e| e.url.clone()).unwrap_or_default(),
        media_type: enclosure.map(|e| e.mime_type.clone()).unwrap_or_default(),
        media_length: enclosure.map(|e| e.length.clone()).unwrap_or_default(),
        web_url,
        description,
        categories: Vec::new(),
        feedback: Vec::new(),
    }
}

// Category mapping.

/// Output categories for a track, inverted from the configured
/// category -> tracks table. Unmapped tracks yield an empty sequence.
pub fn map_track(mapping: &BTreeMap<String, Vec<String>>, track: &str) -> Vec<String> {
    mapping
        .iter()
        .filter(|(category, _)| category.as_str() != DEFAULT_CATEGORY_KEY)
        .filter(|(_, tracks)| tracks.iter().any(|t| t == track))
        .map(|(category, _)| category.clone())
        .collect()
}

/// Fallback categories from the `_default` table entry.
pub fn default_categories(mapping: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    mapping
        .get(DEFAULT_CATEGORY_KEY)
        .cloned()
        .unwrap_or_default()
}

// Rating aggregation.

#[derive(Debug, Clone, PartialEq)]
pub struct RatingSummary {
    pub count: usize,
    pub mean: f64,
    pub block: String,
}

/// Unrounded mean over rated feedback entries; None when no entry carries a
/// rating ("no data" is distinct from "average zero").
pub fn mean_rating(record: &TalkRecord) -> Option<f64> {
    let ratings: Vec<u8> = record.feedback.iter().filter_map(|f| f.rating).collect();
    if ratings.is_empty() {
        return None;
    }
    Some(ratings.iter().map(|r| *r as f64).sum::<f64>() / ratings.len() as f64)
}

/// One-decimal display mean, rounded half-up on the exact tenths value so
/// display never disagrees with itself across platforms.
pub fn display_mean(mean: f64) -> String {
    let tenths = (mean * 10.0).round() as i64;
    format!("{}.{}", tenths / 10, tenths % 10)
}

fn format_stars(rating: u8) -> String {
    "⭐".repeat(rating as usize)
}

fn format_feedback_line(fb: &Feedback) -> String {
    let head = match fb.rating {
        Some(rating) => format!("{} ({rating}/5)", format_stars(rating)),
        None => "💬".to_string(),
    };
    let username = fb.username.as_deref().map(str::trim).unwrap_or("");
    let comment = fb.comment.as_deref().map(str::trim).unwrap_or("");
    match (username.is_empty(), comment.is_empty()) {
        (false, false) => format!("{head} - {username}: {comment}"),
        (false, true) => format!("{head} - {username}"),
        (true, false) => format!("{head} {comment}"),
        (true, true) => head,
    }
}

/// Aggregate a record's feedback into (count, mean, rendered block). The
/// block lists every feedback entry in stored order; comment-only entries
/// render but never count toward the mean. Zero rated entries -> None.
pub fn summarize(record: &TalkRecord) -> Option<RatingSummary> {
    let mean = mean_rating(record)?;
    let count = record.feedback.iter().filter(|f| f.rating.is_some()).count();

    let bar = "━".repeat(SECTION_BAR_LEN);
    let mut lines = vec![
        bar.clone(),
        format!(
            "📊 RATINGS (Average: {}/5 from {count} rating{})",
            display_mean(mean),
            if count == 1 { "" } else { "s" }
        ),
        String::new(),
    ];
    for fb in &record.feedback {
        if fb.rating.is_none() && fb.comment.as_deref().map_or(true, |c| c.trim().is_empty()) {
            continue;
        }
        lines.push(format_feedback_line(fb));
    }
    lines.push(String::new());
    lines.push(bar);
    lines.push(String::new());

    Some(RatingSummary {
        count,
        mean,
        block: lines.join("\n"),
    })
}

// Feed filter.

/// Publication policy: no ratings -> always eligible; unrounded mean above
/// the threshold -> eligible; at or below -> only with `include_all`.
pub fn eligible(record: &TalkRecord, include_all: bool) -> bool {
    match mean_rating(record) {
        None => true,
        Some(mean) => mean > RATING_THRESHOLD || include_all,
    }
}

// Feed renderer.

fn push_element(out: &mut String, indent: &str, tag: &str, text: &str) {
    out.push_str(indent);
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.push_str(&escape(text));
    out.push_str("</");
    out.push_str(tag);
    out.push_str(">\n");
}

fn format_pub_date(raw: &str) -> Option<String> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|dt| dt.format(PUB_DATE_FORMAT).to_string())
}

/// Render the already-filtered record sequence into an RSS document.
/// Deterministic: identical inputs (including `built_at`) produce identical
/// bytes. Returns the document plus non-fatal warnings.
pub fn render_feed(
    meta: &FeedMeta,
    global: &GlobalConfig,
    records: &[TalkRecord],
    built_at: DateTime<Utc>,
) -> (String, Vec<String>) {
    let mut warnings = Vec::new();
    let mut out = String::new();
    let now = built_at.format(PUB_DATE_FORMAT).to_string();

    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<rss version=\"2.0\">\n");
    out.push_str("  <channel>\n");
    push_element(&mut out, "    ", "title", &meta.title);
    if let Some(link) = &global.link {
        push_element(&mut out, "    ", "link", link);
    }
    push_element(&mut out, "    ", "description", &meta.description);
    if let Some(language) = &global.language {
        push_element(&mut out, "    ", "language", language);
    }
    let email = global.contact.as_ref().and_then(|c| c.email.as_deref());
    if let Some(email) = email {
        push_element(&mut out, "    ", "webMaster", email);
        if let Some(author) = &global.author {
            push_element(
                &mut out,
                "    ",
                "managingEditor",
                &format!("{email} ({author})"),
            );
        }
    }
    push_element(
        &mut out,
        "    ",
        "generator",
        concat!("talkfeed ", env!("CARGO_PKG_VERSION")),
    );
    push_element(&mut out, "    ", "pubDate", &now);
    push_element(&mut out, "    ", "lastBuildDate", &now);

    match meta.image_url.as_ref().or(global.image_url.as_ref()) {
        Some(image_url) => {
            out.push_str("    <image>\n");
            push_element(&mut out, "      ", "url", image_url);
            push_element(&mut out, "      ", "title", &meta.title);
            if let Some(link) = &global.link {
                push_element(&mut out, "      ", "link", link);
            }
            out.push_str("    </image>\n");
        }
        None => warnings.push(format!("Feed '{}' has no image URL", meta.title)),
    }

    // Channel categories: first-appearance-ordered union of item categories.
    let mut channel_categories: Vec<&str> = Vec::new();
    for record in records {
        for category in &record.categories {
            if !channel_categories.contains(&category.as_str()) {
                channel_categories.push(category);
            }
        }
    }
    for category in channel_categories {
        push_element(&mut out, "    ", "category", category);
    }

    for record in records {
        out.push_str("    <item>\n");
        push_element(&mut out, "      ", "title", &record.title);
        if !record.web_url.is_empty() {
            push_element(&mut out, "      ", "link", &record.web_url);
        }
        for category in &record.categories {
            push_element(&mut out, "      ", "category", category);
        }

        let description = match summarize(record) {
            Some(summary) => format!("{}{}", summary.block, record.description),
            None => record.description.clone(),
        };
        push_element(&mut out, "      ", "description", &description);

        if !record.published.is_empty() {
            match format_pub_date(&record.published) {
                Some(formatted) => push_element(&mut out, "      ", "pubDate", &formatted),
                None => {
                    warnings.push(format!(
                        "Talk '{}': publication date '{}' is not RFC 2822, emitted verbatim",
                        record.title, record.published
                    ));
                    push_element(&mut out, "      ", "pubDate", &record.published);
                }
            }
        }

        if !record.media_url.is_empty() {
            out.push_str(&format!(
                "      <enclosure url=\"{}\" type=\"{}\" length=\"{}\"/>\n",
                escape(record.media_url.as_str()),
                escape(record.media_type.as_str()),
                escape(record.media_length.as_str())
            ));
        }
        out.push_str("    </item>\n");
    }

    out.push_str("  </channel>\n");
    out.push_str("</rss>\n");

    (out, warnings)
}

fn blank_first_element(document: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    if let Some(start) = document.find(&open) {
        if let Some(end_rel) = document[start..].find(&close) {
            let mut result = String::with_capacity(document.len());
            result.push_str(&document[..start + open.len()]);
            result.push_str(&document[start + end_rel..]);
            return result;
        }
    }
    document.to_string()
}

/// Strip the channel-level timestamps (the only fields that change on every
/// build) so substantive content can be compared across builds.
pub fn normalize_for_comparison(document: &str) -> String {
    let without_pub = blank_first_element(document, "pubDate");
    blank_first_element(&without_pub, "lastBuildDate")
        .trim()
        .to_string()
}

/// True when two rendered documents differ only in their channel timestamps.
pub fn feed_unchanged(old: &str, new: &str) -> bool {
    normalize_for_comparison(old) == normalize_for_comparison(new)
}

// Publish pipeline.

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("validation failed: {}", .0.errors.join("; "))]
    Invalid(ValidationReport),
}

#[derive(Debug)]
pub struct BuildReport {
    pub xml: String,
    pub warnings: Vec<String>,
    pub item_count: usize,
    pub excluded: usize,
}

/// Validate, filter and render one record file. Validation errors block this
/// file only; warnings ride alongside the rendered output.
pub fn build_feed(
    file: &RecordFile,
    global: &GlobalConfig,
    include_all: bool,
    built_at: DateTime<Utc>,
) -> Result<BuildReport, BuildError> {
    let report = validate_record_file(file);
    if report.has_errors() {
        return Err(BuildError::Invalid(report));
    }
    let mut warnings = report.warnings;

    let eligible_records: Vec<TalkRecord> = file
        .feed
        .iter()
        .filter(|record| eligible(record, include_all))
        .cloned()
        .collect();
    let excluded = file.feed.len() - eligible_records.len();
    if excluded > 0 {
        tracing::info!(excluded, "excluded low-rated talk(s)");
    }

    let (xml, render_warnings) = render_feed(&file.meta, global, &eligible_records, built_at);
    warnings.extend(render_warnings);

    Ok(BuildReport {
        item_count: eligible_records.len(),
        xml,
        warnings,
        excluded,
    })
}

// Discovery pipeline.

#[derive(Debug, Clone, Default)]
pub struct DiscoverOptions {
    /// Use the schedule's long description instead of the podcast one.
    pub long_desc: bool,
    /// Explicit categories; bypasses track mapping entirely.
    pub category_override: Option<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Fetch(#[from] talkfeed_store::FetchError),
    #[error(transparent)]
    Document(#[from] talkfeed_schedule::DocumentError),
    #[error("no talk matches query '{query}'")]
    NoMatch { query: String },
    #[error("query '{query}' matches {} identically titled talks", .titles.len())]
    Ambiguous { query: String, titles: Vec<String> },
}

#[derive(Debug)]
pub struct Discovered {
    pub record: TalkRecord,
    pub warnings: Vec<String>,
}

fn staleness_warning(url: &str, provenance: &Provenance) -> Option<String> {
    match provenance {
        Provenance::StaleCache { age } => Some(format!(
            "Served {url} from a stale cache entry ({} h old); the network retrieval failed",
            age.as_secs() / 3600
        )),
        _ => None,
    }
}

/// Full discovery flow: fetch schedule + podcast documents through the
/// cache, index them, match the query and return a single merged record.
pub async fn discover(
    cache: &FetchCache,
    event: &EventConfig,
    global: &GlobalConfig,
    query: &str,
    opts: &DiscoverOptions,
) -> Result<Discovered, DiscoveryError> {
    let mut warnings = Vec::new();

    let schedule_doc = cache.fetch(&event.fahrplan_url).await?;
    warnings.extend(staleness_warning(&event.fahrplan_url, &schedule_doc.provenance));
    let podcast_doc = cache.fetch(&event.media_feed_url).await?;
    warnings.extend(staleness_warning(&event.media_feed_url, &podcast_doc.provenance));

    let candidates = talkfeed_schedule::parse_schedule(&schedule_doc.bytes)?;
    let entries = talkfeed_schedule::parse_podcast(&podcast_doc.bytes)?;

    let candidate = match select_candidate(query, &candidates) {
        Selection::One(candidate) => candidate,
        Selection::Ambiguous(twins) => {
            return Err(DiscoveryError::Ambiguous {
                query: query.to_string(),
                titles: twins.iter().map(|c| c.title.clone()).collect(),
            })
        }
        Selection::None => {
            return Err(DiscoveryError::NoMatch {
                query: query.to_string(),
            })
        }
    };

    let entry = correlate_entry(candidate, &entries);
    if entry.is_none() {
        warnings.push(format!(
            "No podcast entry matched '{}'; media fields left empty",
            candidate.title
        ));
    }

    let mut record = merge_candidate(candidate, entry, event, opts.long_desc);
    if record.web_url.is_empty() {
        warnings.push(format!(
            "Talk '{}' has no web URL: the schedule carries none and no link pattern is configured",
            candidate.title
        ));
    }

    record.categories = match &opts.category_override {
        Some(categories) => categories.clone(),
        None => {
            let mapped = candidate
                .track
                .as_deref()
                .map(|track| map_track(&global.category_mapping, track))
                .unwrap_or_default();
            if mapped.is_empty() {
                default_categories(&global.category_mapping)
            } else {
                mapped
            }
        }
    };

    Ok(Discovered { record, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str) -> TalkCandidate {
        TalkCandidate {
            title: title.to_string(),
            ..TalkCandidate::default()
        }
    }

    fn record_with_ratings(ratings: &[u8]) -> TalkRecord {
        TalkRecord {
            title: "Some Talk".into(),
            feedback: ratings
                .iter()
                .map(|r| Feedback {
                    rating: Some(*r),
                    ..Feedback::default()
                })
                .collect(),
            ..TalkRecord::default()
        }
    }

    #[test]
    fn single_containing_title_wins() {
        let candidates = vec![
            candidate("Opening Ceremony"),
            candidate("Security Nightmares 0x14"),
            candidate("Closing Ceremony"),
        ];
        match select_candidate("Security Nightmares", &candidates) {
            Selection::One(c) => assert_eq!(c.title, "Security Nightmares 0x14"),
            other => panic!("expected single match, got {other:?}"),
        }
    }

    #[test]
    fn exact_title_beats_prefix_and_length() {
        let candidates = vec![
            candidate("Security Nightmares 0x14"),
            candidate("Security Nightmares"),
            candidate("A Security Nightmares Review"),
        ];
        match select_candidate("security nightmares", &candidates) {
            Selection::One(c) => assert_eq!(c.title, "Security Nightmares"),
            other => panic!("expected exact match, got {other:?}"),
        }
    }

    #[test]
    fn prefix_beats_shorter_non_prefix() {
        let candidates = vec![
            candidate("On Hacking"),
            candidate("Hacking the Planet for Fun"),
        ];
        match select_candidate("Hacking", &candidates) {
            Selection::One(c) => assert_eq!(c.title, "Hacking the Planet for Fun"),
            other => panic!("expected prefix match, got {other:?}"),
        }
    }

    #[test]
    fn shorter_title_wins_among_plain_containment() {
        let candidates = vec![
            candidate("The Grand Quantum Computing Circus Spectacular"),
            candidate("On Quantum Computing"),
        ];
        match select_candidate("Quantum Computing", &candidates) {
            Selection::One(c) => assert_eq!(c.title, "On Quantum Computing"),
            other => panic!("expected shortest title, got {other:?}"),
        }
    }

    #[test]
    fn first_seen_breaks_remaining_distinct_ties() {
        let candidates = vec![candidate("On BGP Part A"), candidate("On BGP Part B")];
        match select_candidate("BGP", &candidates) {
            Selection::One(c) => assert_eq!(c.title, "On BGP Part A"),
            other => panic!("expected first-seen winner, got {other:?}"),
        }
    }

    #[test]
    fn identical_normalized_titles_are_ambiguous() {
        let candidates = vec![candidate("Lightning  Talks"), candidate("Lightning Talks")];
        match select_candidate("Lightning", &candidates) {
            Selection::Ambiguous(twins) => assert_eq!(twins.len(), 2),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn selection_is_deterministic_across_calls() {
        let candidates = vec![
            candidate("On BGP Part A"),
            candidate("On BGP Part B"),
            candidate("BGP Deep Dive"),
        ];
        let pick = |_: usize| match select_candidate("BGP", &candidates) {
            Selection::One(c) => c.title.clone(),
            other => panic!("expected single match, got {other:?}"),
        };
        let first = pick(0);
        for round in 1..10 {
            assert_eq!(pick(round), first);
        }
    }

    #[test]
    fn no_containing_title_is_no_match() {
        let candidates = vec![candidate("Opening Ceremony")];
        assert!(matches!(
            select_candidate("Security", &candidates),
            Selection::None
        ));
    }

    #[test]
    fn correlation_strips_event_suffix_and_falls_back_to_fuzzy() {
        let cand = candidate("Security Nightmares 0x14");
        let entries = vec![
            PodcastEntry {
                title: "Something Else".into(),
                ..PodcastEntry::default()
            },
            PodcastEntry {
                title: "Security Nightmares 0x14 (36c3)".into(),
                ..PodcastEntry::default()
            },
        ];
        let matched = correlate_entry(&cand, &entries).expect("correlated");
        assert_eq!(matched.title, "Security Nightmares 0x14 (36c3)");

        // Minor title drift is caught by the fuzzy level.
        let drifted = vec![PodcastEntry {
            title: "Security Nightmare 0x14".into(),
            ..PodcastEntry::default()
        }];
        assert!(correlate_entry(&cand, &drifted).is_some());
    }

    #[test]
    fn guid_correlation_wins_over_titles() {
        let mut cand = candidate("Completely Renamed In Feed");
        cand.guid = Some("aaa-111".into());
        let entries = vec![PodcastEntry {
            title: "Different Title".into(),
            guid: Some("aaa-111".into()),
            ..PodcastEntry::default()
        }];
        assert!(correlate_entry(&cand, &entries).is_some());
    }

    #[test]
    fn merge_without_enclosure_leaves_media_fields_empty() {
        let mut cand = candidate("Some Talk");
        cand.id = Some("101".into());
        let event = EventConfig {
            year: 2019,
            congress_number: 36,
            fahrplan_url: "https://example.test/schedule.xml".into(),
            media_feed_url: "https://example.test/podcast.xml".into(),
            event_pattern_head: Some("https://example.test/events/".into()),
            event_pattern_tail: Some(".html".into()),
        };
        let record = merge_candidate(&cand, None, &event, false);
        assert!(record.media_url.is_empty());
        assert!(record.media_type.is_empty());
        assert_eq!(record.web_url, "https://example.test/events/101.html");
    }

    #[test]
    fn track_mapping_inverts_the_table_and_override_wins() {
        let mut mapping = BTreeMap::new();
        mapping.insert(
            "Technology".to_string(),
            vec!["Security".to_string(), "Hardware".to_string()],
        );
        mapping.insert("Society & Culture".to_string(), vec!["Ethics".to_string()]);
        mapping.insert("_default".to_string(), vec!["Technology".to_string()]);

        assert_eq!(map_track(&mapping, "Security"), vec!["Technology"]);
        assert!(map_track(&mapping, "Art").is_empty());
        assert_eq!(default_categories(&mapping), vec!["Technology"]);
    }

    #[test]
    fn mean_ignores_comment_only_entries() {
        let record = TalkRecord {
            feedback: vec![
                Feedback {
                    rating: Some(5),
                    username: Some("max".into()),
                    comment: Some("great".into()),
                },
                Feedback {
                    rating: Some(4),
                    comment: Some("ok".into()),
                    ..Feedback::default()
                },
                Feedback {
                    rating: Some(5),
                    username: Some("anna".into()),
                    ..Feedback::default()
                },
            ],
            ..TalkRecord::default()
        };
        let summary = summarize(&record).expect("summary");
        assert_eq!(summary.count, 3);
        assert!((summary.mean - 14.0 / 3.0).abs() < 1e-9);
        assert_eq!(display_mean(summary.mean), "4.7");

        let lines: Vec<&str> = summary.block.lines().collect();
        assert_eq!(lines[1], "📊 RATINGS (Average: 4.7/5 from 3 ratings)");
        assert_eq!(lines[3], "⭐⭐⭐⭐⭐ (5/5) - max: great");
        assert_eq!(lines[4], "⭐⭐⭐⭐ (4/5) ok");
        assert_eq!(lines[5], "⭐⭐⭐⭐⭐ (5/5) - anna");
    }

    #[test]
    fn comment_only_entries_render_without_counting() {
        let record = TalkRecord {
            feedback: vec![
                Feedback {
                    rating: Some(4),
                    ..Feedback::default()
                },
                Feedback {
                    username: Some("anna".into()),
                    comment: Some("must watch".into()),
                    ..Feedback::default()
                },
            ],
            ..TalkRecord::default()
        };
        let summary = summarize(&record).expect("summary");
        assert_eq!(summary.count, 1);
        assert!(summary.block.contains("from 1 rating)"));
        assert!(summary.block.contains("💬 - anna: must watch"));
    }

    #[test]
    fn zero_rated_entries_mean_no_summary() {
        let record = TalkRecord {
            feedback: vec![Feedback {
                comment: Some("just a note".into()),
                ..Feedback::default()
            }],
            ..TalkRecord::default()
        };
        assert!(summarize(&record).is_none());
        assert!(mean_rating(&record).is_none());
    }

    #[test]
    fn display_mean_rounds_half_up() {
        assert_eq!(display_mean(2.25), "2.3");
        assert_eq!(display_mean(4.65), "4.7");
        assert_eq!(display_mean(2.04), "2.0");
        assert_eq!(display_mean(3.0), "3.0");
    }

    #[test]
    fn unrated_records_are_always_eligible() {
        let record = TalkRecord::default();
        assert!(eligible(&record, false));
    }

    #[test]
    fn filter_compares_the_unrounded_mean() {
        // Five ratings averaging 2.2 display as "2.2" and pass; an exact 2.0
        // is excluded; a mean of 2.04 would display as "2.0" yet the raw
        // comparison still decides.
        assert!(eligible(&record_with_ratings(&[1, 2, 2, 3, 3]), false));
        assert!(!eligible(&record_with_ratings(&[2, 2]), false));
        assert!(eligible(&record_with_ratings(&[2, 2]), true));

        let mut boundary = record_with_ratings(&[2; 25]);
        boundary.feedback[0].rating = Some(3);
        // 51/25 = 2.04: above the threshold even though it displays as 2.0.
        assert_eq!(display_mean(mean_rating(&boundary).unwrap()), "2.0");
        assert!(eligible(&boundary, false));
    }

    #[test]
    fn build_feed_blocks_on_validation_errors() {
        let file = RecordFile {
            meta: FeedMeta {
                title: "36C3 media feed".into(),
                description: "Curated talks".into(),
                image_url: Some("https://example.test/logo.png".into()),
            },
            feed: vec![TalkRecord {
                title: "Broken".into(),
                categories: vec!["Technology".into()],
                feedback: vec![Feedback::default()],
                ..TalkRecord::default()
            }],
        };
        let err = build_feed(&file, &GlobalConfig::default(), false, Utc::now())
            .expect_err("degenerate feedback must block");
        assert!(err.to_string().contains("neither rating nor comment"));
    }

    #[test]
    fn build_feed_filters_and_counts() {
        let file = RecordFile {
            meta: FeedMeta {
                title: "36C3 media feed".into(),
                description: "Curated talks".into(),
                image_url: Some("https://example.test/logo.png".into()),
            },
            feed: vec![
                {
                    let mut r = record_with_ratings(&[5, 4]);
                    r.title = "Keeper".into();
                    r.categories = vec!["Technology".into()];
                    r
                },
                {
                    let mut r = record_with_ratings(&[1, 2]);
                    r.title = "Dropped".into();
                    r.categories = vec!["Technology".into()];
                    r
                },
            ],
        };
        let report =
            build_feed(&file, &GlobalConfig::default(), false, Utc::now()).expect("build");
        assert_eq!(report.item_count, 1);
        assert_eq!(report.excluded, 1);
        assert!(report.xml.contains("<title>Keeper</title>"));
        assert!(!report.xml.contains("Dropped"));
    }

    #[test]
    fn rendered_count_round_trips_from_the_source() {
        let mut record = record_with_ratings(&[5, 3, 4]);
        record.title = "Round Trip".into();
        record.feedback.push(Feedback {
            comment: Some("no rating here".into()),
            ..Feedback::default()
        });
        let rated = record.feedback.iter().filter(|f| f.rating.is_some()).count();

        let (xml, _) = render_feed(
            &FeedMeta {
                title: "Feed".into(),
                description: "Desc".into(),
                image_url: Some("https://example.test/logo.png".into()),
            },
            &GlobalConfig::default(),
            std::slice::from_ref(&record),
            Utc::now(),
        );
        let needle = format!("from {rated} ratings");
        assert!(xml.contains(&needle), "missing '{needle}' in:\n{xml}");
    }

    #[test]
    fn unchanged_detection_ignores_channel_timestamps_only() {
        let meta = FeedMeta {
            title: "Feed".into(),
            description: "Desc".into(),
            image_url: Some("https://example.test/logo.png".into()),
        };
        let record = TalkRecord {
            title: "Stable".into(),
            published: "Fri, 27 Dec 2019 20:30:00 +0100".into(),
            ..TalkRecord::default()
        };
        let records = vec![record];
        let earlier = Utc::now() - chrono::Duration::hours(2);

        let (old, _) = render_feed(&meta, &GlobalConfig::default(), &records, earlier);
        let (new, _) = render_feed(&meta, &GlobalConfig::default(), &records, Utc::now());
        assert_ne!(old, new);
        assert!(feed_unchanged(&old, &new));

        let mut changed = records.clone();
        changed[0].title = "Renamed".into();
        let (renamed, _) = render_feed(&meta, &GlobalConfig::default(), &changed, Utc::now());
        assert!(!feed_unchanged(&old, &renamed));
    }

    #[test]
    fn reserved_markup_characters_are_escaped() {
        let record = TalkRecord {
            title: "Tubes & <Pipes>".into(),
            description: "a \"quoted\" claim".into(),
            media_url: "https://cdn.example.test/x.mp4?a=1&b=2".into(),
            media_type: "video/mp4".into(),
            media_length: "1".into(),
            ..TalkRecord::default()
        };
        let (xml, _) = render_feed(
            &FeedMeta {
                title: "Feed".into(),
                description: "Desc".into(),
                image_url: Some("https://example.test/logo.png".into()),
            },
            &GlobalConfig::default(),
            &[record],
            Utc::now(),
        );
        assert!(xml.contains("<title>Tubes &amp; &lt;Pipes&gt;</title>"));
        assert!(xml.contains("url=\"https://cdn.example.test/x.mp4?a=1&amp;b=2\""));
        assert!(!xml.contains("<Pipes>"));
    }
}
