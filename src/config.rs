use std::env;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::error::ConfigError;

pub const DEFAULT_SPORTS_KEYWORDS: [&str; 7] = [
    "Curry", "LeBron", "Mahomes", "buzzer", "touchdown", "finals", "playoffs",
];

/// Code points counted as emoji. Defaults to the Emoticons block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmojiRange {
    pub start: char,
    pub end: char,
}

impl Default for EmojiRange {
    fn default() -> Self {
        Self {
            start: '\u{1F600}',
            end: '\u{1F64F}',
        }
    }
}

impl EmojiRange {
    pub fn contains(&self, c: char) -> bool {
        (self.start..=self.end).contains(&c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Constant,
    Linear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(5),
            backoff: Backoff::Constant,
        }
    }
}

impl RetryPolicy {
    /// Delay applied after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Constant => self.base_delay,
            Backoff::Linear => self.base_delay * attempt.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Http,
    Chrome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreConfig {
    Sheets {
        sheet_id: String,
        sheet_name: String,
        access_token: String,
    },
    Postgres {
        database_url: String,
    },
    /// Dry run: rows are kept in process and dropped on exit.
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub account: String,
    pub base_url: String,
    pub fetch_strategy: FetchStrategy,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub state_script_id: String,
    pub emoji_range: EmojiRange,
    pub sports_keywords: Vec<String>,
    pub utc_offset: FixedOffset,
    pub top_n: usize,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: "impulseprod".to_string(),
            base_url: "https://www.tiktok.com".to_string(),
            fetch_strategy: FetchStrategy::Http,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(10),
            state_script_id: "SIGI_STATE".to_string(),
            emoji_range: EmojiRange::default(),
            sports_keywords: DEFAULT_SPORTS_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            utc_offset: Utc.fix(),
            top_n: 5,
            store: StoreConfig::Sheets {
                sheet_id: "10UqBGA93ns5b".to_string(),
                sheet_name: "Impulse Video Tracker".to_string(),
                access_token: String::new(),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from any variable source; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let account = lookup("TIKTOK_ACCOUNT").unwrap_or(defaults.account);
        let base_url = lookup("TIKTOK_BASE_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or(defaults.base_url);

        let fetch_strategy = match lookup("FETCH_STRATEGY").as_deref() {
            None | Some("http") => FetchStrategy::Http,
            Some("chrome") => FetchStrategy::Chrome,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "FETCH_STRATEGY",
                    value: other.to_string(),
                })
            }
        };

        let backoff = match lookup("FETCH_BACKOFF").as_deref() {
            None | Some("constant") => Backoff::Constant,
            Some("linear") => Backoff::Linear,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "FETCH_BACKOFF",
                    value: other.to_string(),
                })
            }
        };
        let attempts: u32 = parse_or(&lookup, "FETCH_RETRIES", defaults.retry.attempts)?;
        if attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "FETCH_RETRIES",
                value: "0".to_string(),
            });
        }
        let retry = RetryPolicy {
            attempts,
            base_delay: Duration::from_secs(parse_or(
                &lookup,
                "FETCH_RETRY_DELAY_SECS",
                defaults.retry.base_delay.as_secs(),
            )?),
            backoff,
        };
        let request_timeout = Duration::from_secs(parse_or(
            &lookup,
            "FETCH_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
        )?);

        let state_script_id = lookup("STATE_SCRIPT_ID").unwrap_or(defaults.state_script_id);

        let emoji_range = EmojiRange {
            start: parse_code_point(&lookup, "EMOJI_RANGE_START", defaults.emoji_range.start)?,
            end: parse_code_point(&lookup, "EMOJI_RANGE_END", defaults.emoji_range.end)?,
        };
        if emoji_range.start > emoji_range.end {
            return Err(ConfigError::Invalid {
                name: "EMOJI_RANGE_END",
                value: format!("{:X}", emoji_range.end as u32),
            });
        }

        let sports_keywords = match lookup("SPORTS_KEYWORDS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.sports_keywords,
        };

        let offset_secs: i32 = parse_or(&lookup, "UTC_OFFSET_SECS", 0)?;
        let utc_offset = FixedOffset::east_opt(offset_secs).ok_or(ConfigError::Invalid {
            name: "UTC_OFFSET_SECS",
            value: offset_secs.to_string(),
        })?;

        let top_n = parse_or(&lookup, "TOP_N", defaults.top_n)?;

        let store = match lookup("STORE_BACKEND").as_deref() {
            None | Some("sheets") => {
                let (default_id, default_name) = match defaults.store {
                    StoreConfig::Sheets {
                        sheet_id,
                        sheet_name,
                        ..
                    } => (sheet_id, sheet_name),
                    _ => (String::new(), String::new()),
                };
                StoreConfig::Sheets {
                    sheet_id: lookup("SHEET_ID").unwrap_or(default_id),
                    sheet_name: lookup("SHEET_NAME").unwrap_or(default_name),
                    access_token: lookup("SHEETS_ACCESS_TOKEN").ok_or(ConfigError::Missing {
                        name: "SHEETS_ACCESS_TOKEN",
                    })?,
                }
            }
            Some("postgres") => StoreConfig::Postgres {
                database_url: lookup("DATABASE_URL").ok_or(ConfigError::Missing {
                    name: "DATABASE_URL",
                })?,
            },
            Some("memory") => StoreConfig::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "STORE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            account,
            base_url,
            fetch_strategy,
            retry,
            request_timeout,
            state_script_id,
            emoji_range,
            sports_keywords,
            utc_offset,
            top_n,
            store,
        })
    }

    /// Account page the videos are discovered on.
    pub fn account_url(&self) -> String {
        format!("{}/@{}", self.base_url, self.account)
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

fn parse_code_point<F>(lookup: &F, name: &'static str, default: char) -> Result<char, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    let hex = raw
        .trim()
        .trim_start_matches("U+")
        .trim_start_matches("0x");
    u32::from_str_radix(hex, 16)
        .ok()
        .and_then(char::from_u32)
        .ok_or(ConfigError::Invalid { name, value: raw })
}
