use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::analysis::CaptionAnalyzer;
use crate::config::Config;
use crate::crawler::Fetcher;
use crate::dedup;
use crate::error::{ExtractDiagnostic, PipelineError, StoreError};
use crate::extract::StateExtractor;
use crate::storage::RecordStore;
use crate::video::{AnalyzedVideo, VideoNormalizer};

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Raw items found in the state blob.
    pub extracted: usize,
    /// Items skipped for lacking an identifier.
    pub invalid: usize,
    pub appended: Vec<AnalyzedVideo>,
    pub diagnostic: Option<ExtractDiagnostic>,
}

impl RunSummary {
    /// Highest scoring appended videos; ties keep append order.
    pub fn top_by_score(&self, n: usize) -> Vec<&AnalyzedVideo> {
        let mut ranked: Vec<&AnalyzedVideo> = self.appended.iter().collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score));
        ranked.truncate(n);
        ranked
    }

    pub fn log(&self, top_n: usize) {
        if let Some(diagnostic) = &self.diagnostic {
            warn!(run_id = %self.run_id, %diagnostic, "Page state unreadable");
        }
        info!(
            run_id = %self.run_id,
            extracted = self.extracted,
            invalid = self.invalid,
            "Added {} new videos",
            self.appended.len()
        );
        for v in self.top_by_score(top_n) {
            info!(id = %v.video.id, "{} | score={}", v.url(), v.score);
        }
    }
}

/// fetch -> extract -> normalize -> analyze/score -> dedup/append, strictly in sequence.
pub struct Pipeline {
    account_url: String,
    fetcher: Fetcher,
    extractor: StateExtractor,
    normalizer: VideoNormalizer,
    analyzer: CaptionAnalyzer,
    store: Box<dyn RecordStore>,
}

impl Pipeline {
    pub fn new(config: &Config, fetcher: Fetcher, store: Box<dyn RecordStore>) -> Self {
        let account_url = config.account_url();
        Self {
            fetcher,
            extractor: StateExtractor::new(config.state_script_id.clone()),
            normalizer: VideoNormalizer::new(&account_url, config.utc_offset),
            analyzer: CaptionAnalyzer::new(config.emoji_range, &config.sports_keywords),
            store,
            account_url,
        }
    }

    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary, PipelineError> {
        info!(url = %self.account_url, "Fetching account page");
        let markup = self.fetcher.fetch(&self.account_url).await?;

        let extraction = self.extractor.extract(&markup);
        let extracted = extraction.items.len();

        let mut invalid = 0;
        let videos: Vec<AnalyzedVideo> = extraction
            .items
            .iter()
            .filter_map(|(key, raw)| match self.normalizer.normalize(key, raw) {
                Ok(video) => Some(video),
                Err(e) => {
                    warn!(error = %e, "Skipping item");
                    invalid += 1;
                    None
                }
            })
            .map(|video| self.analyzer.annotate(video))
            .collect();

        if videos.is_empty() {
            warn!("No videos parsed, nothing to append");
            return Ok(RunSummary {
                run_id,
                extracted,
                invalid,
                appended: Vec::new(),
                diagnostic: extraction.diagnostic,
            });
        }

        let appended = dedup::append_new(self.store.as_ref(), videos)
            .await
            .map_err(|e| match e {
                StoreError::Write { appended, message } => {
                    PipelineError::StoreWrite { appended, message }
                }
                other => PipelineError::StoreWrite {
                    appended: 0,
                    message: other.to_string(),
                },
            })?;

        Ok(RunSummary {
            run_id,
            extracted,
            invalid,
            appended,
            diagnostic: extraction.diagnostic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::crawler::tests::{RecordingSleeper, ScriptedPages};
    use crate::error::TransportError;
    use crate::storage::MemoryStore;
    use crate::video::StoredRow;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const PAGE: &str = r#"<html><body><script id="SIGI_STATE" type="application/json">{
        "ItemModule": {
            "7001": {"id": "7001", "desc": "Curry buzzer beater 😀", "createTime": 1700000000,
                     "stats": {"playCount": 1000, "diggCount": 50, "commentCount": 10, "shareCount": 2}},
            "7002": {"id": "7002", "desc": "LeBron in the playoffs", "createTime": 1700086400,
                     "stats": {"playCount": 5000, "diggCount": 100, "commentCount": 0, "shareCount": 0}},
            "": {"id": "", "desc": "broken"},
            "7003": {"id": "7003", "desc": "", "stats": {}}
        }
    }</script></body></html>"#;

    /// Shares rows with the test through an Arc and counts every call.
    /// With `fail_after` set, appends fail once that many rows are stored.
    #[derive(Clone, Default)]
    struct SharedStore {
        inner: Arc<MemoryStore>,
        calls: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl RecordStore for SharedStore {
        async fn existing_keys(&self) -> Result<HashSet<String>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.existing_keys().await
        }

        async fn append_row(&self, row: &StoredRow) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_after {
                if self.inner.rows().len() >= limit {
                    return Err(StoreError::Write {
                        appended: 0,
                        message: "rate limited".to_string(),
                    });
                }
            }
            self.inner.append_row(row).await
        }
    }

    fn config() -> Config {
        Config {
            retry: RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_secs(5),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pipeline(pages: Vec<Result<crate::crawler::PageResponse, TransportError>>, store: SharedStore) -> Pipeline {
        let config = config();
        let fetcher = Fetcher::new(
            Arc::new(ScriptedPages::new(pages)),
            config.retry.clone(),
            Arc::new(RecordingSleeper::default()),
        );
        Pipeline::new(&config, fetcher, Box::new(store))
    }

    #[tokio::test]
    async fn full_run_appends_scored_rows() {
        let store = SharedStore::default();
        let summary = pipeline(vec![ScriptedPages::ok(PAGE)], store.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.extracted, 4);
        assert_eq!(summary.invalid, 1);
        assert!(summary.diagnostic.is_none());

        let rows = store.inner.rows();
        let urls: Vec<&str> = rows.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://www.tiktok.com/@impulseprod/video/7001",
                "https://www.tiktok.com/@impulseprod/video/7002",
                "https://www.tiktok.com/@impulseprod/video/7003",
            ]
        );

        let first = &rows[0];
        assert_eq!(first.score, 1140);
        assert_eq!(first.emoji_count, 1);
        assert_eq!(first.word_count, 4);
        assert_eq!(first.sports_keyword_count, 2);
        assert_eq!(first.date, "2023-11-14");
        assert!(rows.iter().all(StoredRow::score_is_consistent));

        let third = &rows[2];
        assert_eq!(third.score, 0);
        assert_eq!(third.date, "1970-01-01");

        let top: Vec<u64> = summary.top_by_score(2).iter().map(|v| v.score).collect();
        assert_eq!(top, vec![5200, 1140]);
    }

    #[tokio::test]
    async fn rerun_with_same_page_appends_nothing() {
        let store = SharedStore::default();

        let first = pipeline(vec![ScriptedPages::ok(PAGE)], store.clone())
            .run()
            .await
            .unwrap();
        let second = pipeline(vec![ScriptedPages::ok(PAGE)], store.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(first.appended.len(), 3);
        assert!(second.appended.is_empty());
        assert_eq!(store.inner.rows().len(), 3);
        let keys: HashSet<String> = store.inner.rows().into_iter().map(|r| r.url).collect();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn page_without_state_finishes_with_zero_videos() {
        let store = SharedStore::default();
        let summary = pipeline(
            vec![ScriptedPages::ok("<html><body>Please verify you are human</body></html>")],
            store.clone(),
        )
        .run()
        .await
        .unwrap();

        assert!(summary.appended.is_empty());
        assert!(matches!(
            summary.diagnostic,
            Some(ExtractDiagnostic::LayoutChanged { .. })
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broken_state_blob_finishes_with_zero_videos() {
        let store = SharedStore::default();
        let page = r#"<html><script id="SIGI_STATE">{"ItemModule": {"7001": </script></html>"#;

        let summary = pipeline(vec![ScriptedPages::ok(page)], store.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.extracted, 0);
        assert!(summary.appended.is_empty());
        assert!(matches!(
            summary.diagnostic,
            Some(ExtractDiagnostic::MalformedState(_))
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_write_failure_surfaces_code_and_keeps_earlier_rows() {
        let store = SharedStore {
            fail_after: Some(1),
            ..Default::default()
        };

        let err = pipeline(vec![ScriptedPages::ok(PAGE)], store.clone())
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.code(), "STORE_WRITE_FAILED");
        match err {
            PipelineError::StoreWrite { appended, .. } => assert_eq!(appended, 1),
            other => panic!("unexpected error: {other}"),
        }
        let urls: Vec<String> = store.inner.rows().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec!["https://www.tiktok.com/@impulseprod/video/7001"]);
    }

    #[tokio::test]
    async fn fetch_exhaustion_touches_no_store() {
        let store = SharedStore::default();
        let err = pipeline(
            vec![
                ScriptedPages::status(403),
                Err(TransportError::Timeout),
                ScriptedPages::status(403),
            ],
            store.clone(),
        )
        .run()
        .await
        .unwrap_err();

        assert_eq!(err.code(), "FETCH_EXHAUSTED");
        match err {
            PipelineError::Fetch(fetch) => {
                assert_eq!(fetch.attempts, 3);
                assert_eq!(fetch.last, TransportError::Status(403));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn top_by_score_is_stable_for_ties() {
        let analyzer = CaptionAnalyzer::new(Default::default(), &[]);
        let normalizer = VideoNormalizer::new("https://www.tiktok.com/@impulseprod", config().utc_offset);
        let make = |id: &str, views: u64| {
            let raw = serde_json::json!({"id": id, "stats": {"playCount": views}});
            analyzer.annotate(normalizer.normalize(id, &raw).unwrap())
        };

        let summary = RunSummary {
            run_id: Uuid::nil(),
            extracted: 3,
            invalid: 0,
            appended: vec![make("1", 10), make("2", 30), make("3", 10)],
            diagnostic: None,
        };

        let ids: Vec<&str> = summary
            .top_by_score(5)
            .iter()
            .map(|v| v.video.id.as_str())
            .collect();
        assert_eq!(ids, vec!["2", "1", "3"]);
    }
}
