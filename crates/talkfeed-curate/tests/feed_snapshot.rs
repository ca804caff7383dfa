//! Byte-exact rendering snapshot for a small two-talk channel.

use chrono::{TimeZone, Utc};
use talkfeed_core::{FeedMeta, Feedback, GlobalConfig, RecordFile, TalkRecord};
use talkfeed_curate::{build_feed, feed_unchanged};

fn sample_file() -> RecordFile {
    RecordFile {
        meta: FeedMeta {
            title: "36C3 media feed".into(),
            description: "A curated feed for different talks of the 36C3.".into(),
            image_url: Some("https://static.example.test/media/congress/2019/logo.png".into()),
        },
        feed: vec![
            TalkRecord {
                title: "Security Nightmares 0x14".into(),
                published: "Fri, 27 Dec 2019 20:30:00 +0100".into(),
                speakers: "frank, ron".into(),
                media_url: "https://cdn.example.test/36c3/101-hq.mp4".into(),
                media_type: "video/mp4".into(),
                media_length: "123456789".into(),
                web_url: "https://example.test/events/101.html".into(),
                description: "What could possibly go wrong?".into(),
                categories: vec!["Technology".into()],
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
            },
            TalkRecord {
                title: "Tubes & Pipes".into(),
                categories: vec!["Science".into()],
                ..TalkRecord::default()
            },
        ],
    }
}

fn sample_global() -> GlobalConfig {
    GlobalConfig {
        contact: Some(talkfeed_core::Contact {
            email: Some("feed@example.test".into()),
        }),
        author: Some("Feed Curators".into()),
        link: Some("https://example.test/talks".into()),
        language: Some("en".into()),
        ..GlobalConfig::default()
    }
}

const EXPECTED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>36C3 media feed</title>
    <link>https://example.test/talks</link>
    <description>A curated feed for different talks of the 36C3.</description>
    <language>en</language>
    <webMaster>feed@example.test</webMaster>
    <managingEditor>feed@example.test (Feed Curators)</managingEditor>
    <generator>talkfeed 0.1.0</generator>
    <pubDate>Wed, 15 Jan 2020 12:00:00 +0000</pubDate>
    <lastBuildDate>Wed, 15 Jan 2020 12:00:00 +0000</lastBuildDate>
    <image>
      <url>https://static.example.test/media/congress/2019/logo.png</url>
      <title>36C3 media feed</title>
      <link>https://example.test/talks</link>
    </image>
    <category>Technology</category>
    <category>Science</category>
    <item>
      <title>Security Nightmares 0x14</title>
      <link>https://example.test/events/101.html</link>
      <category>Technology</category>
      <description>━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
📊 RATINGS (Average: 4.7/5 from 3 ratings)

⭐⭐⭐⭐⭐ (5/5) - max: great
⭐⭐⭐⭐ (4/5) ok
⭐⭐⭐⭐⭐ (5/5) - anna

━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
What could possibly go wrong?</description>
      <pubDate>Fri, 27 Dec 2019 20:30:00 +0100</pubDate>
      <enclosure url="https://cdn.example.test/36c3/101-hq.mp4" type="video/mp4" length="123456789"/>
    </item>
    <item>
      <title>Tubes &amp; Pipes</title>
      <category>Science</category>
      <description></description>
    </item>
  </channel>
</rss>
"#;

#[test]
fn rendering_is_byte_identical_for_identical_input() {
    let built_at = Utc.with_ymd_and_hms(2020, 1, 15, 12, 0, 0).single().unwrap();
    let report = build_feed(&sample_file(), &sample_global(), false, built_at).expect("build");
    assert_eq!(report.item_count, 2);
    assert_eq!(report.excluded, 0);
    assert_eq!(report.xml, EXPECTED);

    let again = build_feed(&sample_file(), &sample_global(), false, built_at).expect("rebuild");
    assert_eq!(again.xml, report.xml);
}

#[test]
fn rebuild_at_a_later_time_counts_as_unchanged() {
    let first = Utc.with_ymd_and_hms(2020, 1, 15, 12, 0, 0).single().unwrap();
    let later = Utc.with_ymd_and_hms(2020, 2, 1, 8, 30, 0).single().unwrap();
    let a = build_feed(&sample_file(), &sample_global(), false, first).expect("build");
    let b = build_feed(&sample_file(), &sample_global(), false, later).expect("build");
    assert_ne!(a.xml, b.xml);
    assert!(feed_unchanged(&a.xml, &b.xml));
}
