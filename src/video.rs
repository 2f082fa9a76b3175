use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use crate::analysis::{score, CaptionSignals, Counts};
use crate::error::InvalidRecord;

/// Calendar date written to the store, rendered in the configured zone.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Zero-based position of the url column in a [`StoredRow`].
pub const URL_COLUMN: usize = 6;

pub const HEADER: [&str; 11] = [
    "Caption",
    "Views",
    "Likes",
    "Comments",
    "Shares",
    "Date",
    "URL",
    "Score",
    "Emojis",
    "Words",
    "Sports Keywords",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Video {
    pub id: String,
    pub caption: String,
    pub counts: Counts,
    pub date: String,
    /// Dedup key, `<base>/@<account>/video/<id>`.
    pub url: String,
}

/// A video with its derived metrics attached.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedVideo {
    pub video: Video,
    pub score: u64,
    pub signals: CaptionSignals,
}

impl AnalyzedVideo {
    pub fn url(&self) -> &str {
        &self.video.url
    }

    pub fn to_row(&self) -> StoredRow {
        StoredRow {
            caption: self.video.caption.clone(),
            views: self.video.counts.views,
            likes: self.video.counts.likes,
            comments: self.video.counts.comments,
            shares: self.video.counts.shares,
            date: self.video.date.clone(),
            url: self.video.url.clone(),
            score: self.score,
            emoji_count: self.signals.emoji_count,
            word_count: self.signals.word_count,
            sports_keyword_count: self.signals.sports_keyword_count,
        }
    }
}

/// The flat row persisted per video, in fixed column order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub caption: String,
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub date: String,
    pub url: String,
    pub score: u64,
    pub emoji_count: u64,
    pub word_count: u64,
    pub sports_keyword_count: u64,
}

impl StoredRow {
    pub fn counts(&self) -> Counts {
        Counts {
            views: self.views,
            likes: self.likes,
            comments: self.comments,
            shares: self.shares,
        }
    }

    /// True when the stored score still matches its counts.
    pub fn score_is_consistent(&self) -> bool {
        score(&self.counts()) == self.score
    }

    pub fn to_values(&self) -> Vec<Value> {
        vec![
            Value::from(self.caption.as_str()),
            Value::from(self.views),
            Value::from(self.likes),
            Value::from(self.comments),
            Value::from(self.shares),
            Value::from(self.date.as_str()),
            Value::from(self.url.as_str()),
            Value::from(self.score),
            Value::from(self.emoji_count),
            Value::from(self.word_count),
            Value::from(self.sports_keyword_count),
        ]
    }
}

/// Maps raw `ItemModule` records onto [`Video`].
pub struct VideoNormalizer {
    video_base: String,
    offset: FixedOffset,
}

impl VideoNormalizer {
    /// `account_url` is the page the items came from, e.g. `https://www.tiktok.com/@impulseprod`.
    pub fn new(account_url: &str, offset: FixedOffset) -> Self {
        Self {
            video_base: format!("{}/video", account_url.trim_end_matches('/')),
            offset,
        }
    }

    pub fn normalize(&self, key: &str, raw: &Value) -> Result<Video, InvalidRecord> {
        let id = raw
            .get("id")
            .and_then(identifier)
            .or_else(|| Some(key.trim().to_string()).filter(|k| !k.is_empty()))
            .ok_or_else(|| InvalidRecord {
                key: key.to_string(),
            })?;

        let caption = raw
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let stats = raw.get("stats");
        let stat = |name: &str| stats.and_then(|s| s.get(name)).map(count).unwrap_or(0);
        let counts = Counts {
            views: stat("playCount"),
            likes: stat("diggCount"),
            comments: stat("commentCount"),
            shares: stat("shareCount"),
        };

        let epoch = raw.get("createTime").map(epoch_seconds).unwrap_or(0);
        let date = DateTime::from_timestamp(epoch, 0)
            .unwrap_or_default()
            .with_timezone(&self.offset)
            .format(DATE_FORMAT)
            .to_string();

        Ok(Video {
            url: format!("{}/{}", self.video_base, id),
            id,
            caption,
            counts,
            date,
        })
    }
}

fn identifier(value: &Value) -> Option<String> {
    let id = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(id).filter(|id| !id.is_empty())
}

/// Coerces a stat into a non-negative integer. Anything unreadable counts as 0.
fn count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && *f > 0.0)
                        .map(|f| f as u64)
                })
                .unwrap_or(0)
        }
        _ => 0,
    }
}

fn epoch_seconds(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Offset, Utc};
    use serde_json::json;

    fn normalizer() -> VideoNormalizer {
        VideoNormalizer::new("https://www.tiktok.com/@impulseprod", Utc.fix())
    }

    #[test]
    fn normalizes_full_record() {
        let raw = json!({
            "id": "7301",
            "desc": "Curry from deep 😀",
            "createTime": 1700000000,
            "stats": {"playCount": 1000, "diggCount": 50, "commentCount": 10, "shareCount": 2}
        });

        let video = normalizer().normalize("7301", &raw).unwrap();

        assert_eq!(video.id, "7301");
        assert_eq!(video.caption, "Curry from deep 😀");
        assert_eq!(
            video.counts,
            Counts {
                views: 1000,
                likes: 50,
                comments: 10,
                shares: 2
            }
        );
        assert_eq!(video.date, "2023-11-14");
        assert_eq!(video.url, "https://www.tiktok.com/@impulseprod/video/7301");
    }

    #[test]
    fn missing_fields_default() {
        let video = normalizer().normalize("42", &json!({"id": "42"})).unwrap();

        assert_eq!(video.caption, "");
        assert_eq!(video.counts, Counts::default());
        assert_eq!(video.date, "1970-01-01");
    }

    #[test]
    fn counts_are_coerced() {
        let raw = json!({
            "id": 99,
            "stats": {"playCount": "1200", "diggCount": 12.7, "commentCount": -4, "shareCount": null}
        });

        let video = normalizer().normalize("99", &raw).unwrap();

        assert_eq!(video.id, "99");
        assert_eq!(video.counts.views, 1200);
        assert_eq!(video.counts.likes, 12);
        assert_eq!(video.counts.comments, 0);
        assert_eq!(video.counts.shares, 0);
    }

    #[test]
    fn falls_back_to_mapping_key() {
        let video = normalizer().normalize("555", &json!({"desc": "no id field"})).unwrap();
        assert_eq!(video.url, "https://www.tiktok.com/@impulseprod/video/555");
    }

    #[test]
    fn missing_identifier_is_invalid() {
        let err = normalizer()
            .normalize("  ", &json!({"id": "", "desc": "orphan"}))
            .unwrap_err();
        assert_eq!(err.key, "  ");
    }

    #[test]
    fn date_uses_configured_offset() {
        // 2023-11-14T22:13:20Z
        let raw = json!({"id": "1", "createTime": "1700000000"});
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();

        let video = VideoNormalizer::new("https://www.tiktok.com/@impulseprod/", tokyo)
            .normalize("1", &raw)
            .unwrap();

        assert_eq!(video.date, "2023-11-15");
        assert_eq!(video.url, "https://www.tiktok.com/@impulseprod/video/1");
    }

    #[test]
    fn row_keeps_column_order() {
        let row = StoredRow {
            caption: "c".into(),
            views: 1,
            likes: 2,
            comments: 3,
            shares: 4,
            date: "2024-01-01".into(),
            url: "u".into(),
            score: 34,
            emoji_count: 0,
            word_count: 1,
            sports_keyword_count: 0,
        };

        let values = row.to_values();

        assert_eq!(values.len(), HEADER.len());
        assert_eq!(values[URL_COLUMN], "u");
        assert_eq!(HEADER[URL_COLUMN], "URL");
        assert!(row.score_is_consistent());
    }
}
