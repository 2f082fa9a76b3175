use regex::Regex;

use crate::config::EmojiRange;
use crate::video::{AnalyzedVideo, Video};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
}

/// Weighted engagement: `views + 2*likes + 3*comments + 5*shares`.
pub fn score(counts: &Counts) -> u64 {
    counts
        .views
        .saturating_add(counts.likes.saturating_mul(2))
        .saturating_add(counts.comments.saturating_mul(3))
        .saturating_add(counts.shares.saturating_mul(5))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptionSignals {
    pub emoji_count: u64,
    pub word_count: u64,
    pub sports_keyword_count: u64,
}

/// Caption-only signals. Holds no state besides its configuration.
pub struct CaptionAnalyzer {
    emoji_range: EmojiRange,
    keywords: Vec<Regex>,
}

impl CaptionAnalyzer {
    pub fn new(emoji_range: EmojiRange, keywords: &[String]) -> Self {
        let keywords = keywords
            .iter()
            .filter(|k| !k.is_empty())
            .filter_map(|k| Regex::new(&format!("(?i){}", regex::escape(k))).ok())
            .collect();
        Self {
            emoji_range,
            keywords,
        }
    }

    pub fn analyze(&self, caption: &str) -> CaptionSignals {
        CaptionSignals {
            emoji_count: caption.chars().filter(|c| self.emoji_range.contains(*c)).count() as u64,
            word_count: caption.split_whitespace().count() as u64,
            sports_keyword_count: self
                .keywords
                .iter()
                .map(|re| re.find_iter(caption).count() as u64)
                .sum(),
        }
    }

    pub fn annotate(&self, video: Video) -> AnalyzedVideo {
        let signals = self.analyze(&video.caption);
        AnalyzedVideo {
            score: score(&video.counts),
            signals,
            video,
        }
    }
}
