//! Per-repository enrichment: metadata, contributor counts, commit dates,
//! and keyword filtering.
//!
//! Every job walks an identifier list in order and checkpoints
//! `last_processed_index` after each row it writes. Identifiers already in
//! the output are skipped, so a crash between a write and its checkpoint
//! costs one repeated request, never a duplicate row.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::github::{retry_request, RepoApi, RepoRecord};
use crate::pacing::{Pacer, RetryPolicy};
use crate::table::{SeenSet, TableWriter};

const CONTRIBUTORS_PER_PAGE: u32 = 100;

/// What to produce for each repository
#[derive(Debug, Clone)]
pub enum EnrichJob {
    /// Full metadata row
    Metadata,
    /// Metadata row, kept only when a keyword matches
    Filter { keywords: Vec<String> },
    /// `contributors_count`, `-1` when counting failed
    Contributors,
    /// Oldest and newest author dates on the first commits page
    Commits,
}

impl EnrichJob {
    pub fn columns(&self) -> Vec<&'static str> {
        match self {
            EnrichJob::Metadata | EnrichJob::Filter { .. } => RepoRecord::COLUMNS.to_vec(),
            EnrichJob::Contributors => vec!["full_name", "contributors_count"],
            EnrichJob::Commits => vec!["full_name", "first_commit_date", "last_commit_date"],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EnrichJob::Metadata => "enrich",
            EnrichJob::Filter { .. } => "filter",
            EnrichJob::Contributors => "contributors",
            EnrichJob::Commits => "commits",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichStats {
    pub processed: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Enricher<'a> {
    api: &'a dyn RepoApi,
    pacer: &'a dyn Pacer,
    retry: RetryPolicy,
}

impl<'a> Enricher<'a> {
    pub fn new(api: &'a dyn RepoApi, pacer: &'a dyn Pacer, retry: RetryPolicy) -> Self {
        Self { api, pacer, retry }
    }

    /// Repository metadata, or `None` when it is gone or every attempt failed
    pub async fn fetch_metadata(&self, full_name: &str) -> Option<RepoRecord> {
        let api = self.api;
        let result = retry_request(&self.retry, self.pacer, |e| e.is_transient(), || {
            api.get_repo(full_name)
        })
        .await;

        match result {
            Ok(Some(mut record)) => {
                // keep the identifier the input used, even after a rename
                record.full_name = full_name.to_string();
                Some(record)
            }
            Ok(None) => {
                warn!(repo = full_name, "repository not found");
                None
            }
            Err(e) => {
                warn!(repo = full_name, error = %e, "metadata fetch failed");
                None
            }
        }
    }

    /// Total contributors over all pages, anonymous ones included; `-1` when
    /// any page fails
    pub async fn count_contributors(&self, full_name: &str) -> i64 {
        let api = self.api;
        let mut total: i64 = 0;
        let mut page = 1;

        loop {
            let result = retry_request(&self.retry, self.pacer, |e| e.is_transient(), || {
                api.contributors_page(full_name, page, CONTRIBUTORS_PER_PAGE)
            })
            .await;

            match result {
                Ok(0) => break,
                Ok(n) => {
                    total += n as i64;
                    if n < CONTRIBUTORS_PER_PAGE as usize {
                        break;
                    }
                    page += 1;
                }
                Err(e) => {
                    warn!(repo = full_name, page, error = %e, "contributors fetch failed");
                    return -1;
                }
            }
        }
        total
    }

    /// `(oldest, newest)` author date on the first commits page
    pub async fn commit_span(&self, full_name: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let api = self.api;
        let result = retry_request(&self.retry, self.pacer, |e| e.is_transient(), || {
            api.commit_dates(full_name)
        })
        .await;

        match result {
            Ok(dates) => {
                let oldest = dates.iter().min()?;
                let newest = dates.iter().max()?;
                Some((*oldest, *newest))
            }
            Err(e) => {
                warn!(repo = full_name, error = %e, "commits fetch failed");
                None
            }
        }
    }

    /// Row for one repository, or `None` when nothing should be written
    async fn row_for(&self, job: &EnrichJob, full_name: &str) -> Option<Vec<String>> {
        match job {
            EnrichJob::Metadata => self.fetch_metadata(full_name).await.map(|r| r.to_row()),
            EnrichJob::Filter { keywords } => self
                .fetch_metadata(full_name)
                .await
                .filter(|r| r.matches_keywords(keywords))
                .map(|r| r.to_row()),
            EnrichJob::Contributors => {
                let count = self.count_contributors(full_name).await;
                Some(vec![full_name.to_string(), count.to_string()])
            }
            EnrichJob::Commits => {
                let (first, last) = match self.commit_span(full_name).await {
                    Some((oldest, newest)) => (format_date(&oldest), format_date(&newest)),
                    None => (String::new(), String::new()),
                };
                Some(vec![full_name.to_string(), first, last])
            }
        }
    }

    /// Run `job` over `ids`, resuming after the index stored under `key`.
    pub async fn run(
        &self,
        job: &EnrichJob,
        ids: &[String],
        seen: &mut SeenSet,
        out: &mut TableWriter,
        checkpoints: &mut dyn CheckpointStore,
        key: &str,
    ) -> Result<EnrichStats> {
        let start = checkpoints.load(key).unwrap_or(0) as usize;
        if start > 0 {
            info!(job = job.name(), index = start, "resuming from checkpoint");
        }

        let mut stats = EnrichStats::default();
        let total = ids.len();

        for (idx, full_name) in ids.iter().enumerate().skip(start) {
            let full_name = full_name.trim();
            stats.processed += 1;
            if full_name.is_empty() || seen.contains(full_name) {
                stats.skipped += 1;
                continue;
            }

            match self.row_for(job, full_name).await {
                Some(row) => {
                    out.write_row(&row)?;
                    seen.insert(full_name);
                    checkpoints.save(key, (idx + 1) as u64)?;
                    stats.written += 1;
                    info!(job = job.name(), repo = full_name, "[{}/{}] saved", idx + 1, total);
                }
                None => {
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::error::ApiError;
    use crate::pacing::NoPacer;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeRepos {
        repos: HashMap<String, RepoRecord>,
        contributors: HashMap<String, usize>,
        commits: HashMap<String, Vec<DateTime<Utc>>>,
        broken: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRepos {
        fn with_repo(mut self, full_name: &str, description: &str) -> Self {
            self.repos.insert(
                full_name.to_string(),
                RepoRecord {
                    full_name: full_name.to_string(),
                    description: Some(description.to_string()),
                    stargazers_count: Some(7),
                    ..Default::default()
                },
            );
            self
        }

        fn failure(&self, full_name: &str) -> Option<ApiError> {
            self.broken
                .iter()
                .any(|b| b == full_name)
                .then(|| ApiError::Status { status: 502, body: String::new() })
        }
    }

    #[async_trait]
    impl RepoApi for FakeRepos {
        async fn get_repo(&self, full_name: &str) -> Result<Option<RepoRecord>, ApiError> {
            self.calls.lock().unwrap().push(full_name.to_string());
            if let Some(e) = self.failure(full_name) {
                return Err(e);
            }
            Ok(self.repos.get(full_name).cloned())
        }

        async fn contributors_page(&self, full_name: &str, page: u32, per_page: u32) -> Result<usize, ApiError> {
            if let Some(e) = self.failure(full_name) {
                return Err(e);
            }
            let total = self.contributors.get(full_name).copied().unwrap_or(0);
            let start = ((page - 1) * per_page) as usize;
            Ok(total.saturating_sub(start).min(per_page as usize))
        }

        async fn commit_dates(&self, full_name: &str) -> Result<Vec<DateTime<Utc>>, ApiError> {
            if let Some(e) = self.failure(full_name) {
                return Err(e);
            }
            Ok(self.commits.get(full_name).cloned().unwrap_or_default())
        }
    }

    fn enricher(api: &FakeRepos) -> Enricher<'_> {
        Enricher::new(api, &NoPacer, RetryPolicy::new(2, Duration::ZERO))
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_metadata_skips_failures_without_marking_seen() {
        let mut api = FakeRepos::default()
            .with_repo("a/one", "first")
            .with_repo("c/three", "third");
        api.broken.push("b/two".to_string());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enriched.csv");
        let mut out = TableWriter::append(&path, &EnrichJob::Metadata.columns()).unwrap();
        let mut store = MemoryCheckpointStore::new();
        let mut seen = SeenSet::new();

        let stats = enricher(&api)
            .run(&EnrichJob::Metadata, &ids(&["a/one", "b/two", "", "c/three"]), &mut seen, &mut out, &mut store, "enrich-x")
            .await
            .unwrap();

        assert_eq!(stats.written, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
        assert!(!seen.contains("b/two"));
        assert_eq!(store.load("enrich-x"), Some(4));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.contains("a/one,,,,7,"));
    }

    #[tokio::test]
    async fn test_resume_skips_done_rows() {
        let api = FakeRepos::default()
            .with_repo("a/one", "first")
            .with_repo("b/two", "second");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enriched.csv");
        let mut out = TableWriter::append(&path, &EnrichJob::Metadata.columns()).unwrap();
        let mut store = MemoryCheckpointStore::new();
        store.save("enrich-x", 1).unwrap();
        let mut seen = SeenSet::new();

        enricher(&api)
            .run(&EnrichJob::Metadata, &ids(&["a/one", "b/two"]), &mut seen, &mut out, &mut store, "enrich-x")
            .await
            .unwrap();

        assert_eq!(*api.calls.lock().unwrap(), vec!["b/two".to_string()]);
    }

    #[tokio::test]
    async fn test_already_written_ids_are_not_refetched() {
        let api = FakeRepos::default().with_repo("a/one", "first");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enriched.csv");
        let mut out = TableWriter::append(&path, &EnrichJob::Metadata.columns()).unwrap();
        let mut store = MemoryCheckpointStore::new();
        let mut seen = SeenSet::new();
        seen.insert("a/one");

        let stats = enricher(&api)
            .run(&EnrichJob::Metadata, &ids(&["a/one"]), &mut seen, &mut out, &mut store, "k")
            .await
            .unwrap();

        assert_eq!(stats.skipped, 1);
        assert!(api.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filter_keeps_keyword_matches() {
        let api = FakeRepos::default()
            .with_repo("a/vision-api", "nothing here")
            .with_repo("b/webapp", "Deployed on Google Cloud")
            .with_repo("c/tools", "misc");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filtered.csv");
        let job = EnrichJob::Filter {
            keywords: ids(&["vision", "cloud"]),
        };
        let mut out = TableWriter::append(&path, &job.columns()).unwrap();
        let mut store = MemoryCheckpointStore::new();
        let mut seen = SeenSet::new();

        let stats = enricher(&api)
            .run(&job, &ids(&["a/vision-api", "b/webapp", "c/tools"]), &mut seen, &mut out, &mut store, "filter")
            .await
            .unwrap();

        assert_eq!(stats.written, 2);
        assert!(!seen.contains("c/tools"));
    }

    #[tokio::test]
    async fn test_count_contributors_paginates() {
        let mut api = FakeRepos::default();
        api.contributors.insert("a/big".into(), 250);
        api.contributors.insert("b/round".into(), 200);
        api.broken.push("c/broken".into());

        let e = enricher(&api);
        assert_eq!(e.count_contributors("a/big").await, 250);
        assert_eq!(e.count_contributors("b/round").await, 200);
        assert_eq!(e.count_contributors("z/empty").await, 0);
        assert_eq!(e.count_contributors("c/broken").await, -1);
    }

    #[tokio::test]
    async fn test_commit_span_row() {
        let mut api = FakeRepos::default();
        let newest = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let oldest = Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap();
        api.commits.insert("a/one".into(), vec![newest, oldest]);

        let e = enricher(&api);
        assert_eq!(e.commit_span("a/one").await, Some((oldest, newest)));
        assert_eq!(e.commit_span("b/none").await, None);

        let row = e.row_for(&EnrichJob::Commits, "a/one").await.unwrap();
        assert_eq!(row, vec!["a/one", "2023-01-02T03:04:05Z", "2024-05-01T12:00:00Z"]);
        let row = e.row_for(&EnrichJob::Commits, "b/none").await.unwrap();
        assert_eq!(row, vec!["b/none", "", ""]);
    }
}
