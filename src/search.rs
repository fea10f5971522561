//! Paginated, resumable search collection.
//!
//! One query is drained page by page: every page's unseen items are appended
//! to the sink, then the page number is checkpointed, then the next page is
//! requested. Queries larger than the API's result window are split into
//! facet ranges and each range is drained as its own query.

use anyhow::Result;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::checkpoint::{checkpoint_key, sanitize_label, CheckpointStore};
use crate::error::{ApiError, MinerError};
use crate::github::{retry_request, RepoRecord, SearchApi, SearchItem, SearchKind, SearchPage};
use crate::pacing::{Pacer, RetryPolicy};
use crate::partition::{generate_ranges_from, partitioned_query, Facet, PartitionRange};
use crate::table::{SeenSet, TableWriter, ID_COLUMN};

/// GitHub search never returns more than this many results for one query
pub const RESULT_WINDOW: u64 = 1000;

/// Qualifiers every topic query carries; the trailing star floor is replaced
/// by a star range when the query is partitioned
const TOPIC_FILTERS: &str = "fork:false size:>0 forks:>2";
const TOPIC_STAR_FLOOR: &str = "stars:>2";
/// Lowest star count `TOPIC_STAR_FLOOR` admits
const TOPIC_MIN_STARS: u64 = 3;

/// Full repository search query for one topic
pub fn topic_query(topic: &str) -> String {
    format!("{} {}", topic_partition_base(topic), TOPIC_STAR_FLOOR)
}

/// Topic query without the star qualifier, used as the base of star ranges
pub fn topic_partition_base(topic: &str) -> String {
    let topic = topic.trim();
    format!("{} in:name,description,readme topic:{} {}", topic, topic, TOPIC_FILTERS)
}

/// A bare file extension becomes `extension:<ext>`; anything with a space or
/// a qualifier is used verbatim.
pub fn code_query(input: &str) -> Result<String, MinerError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(MinerError::InvalidQuery("empty code search query".to_string()));
    }
    if input.contains(' ') || input.contains(':') {
        Ok(input.to_string())
    } else {
        Ok(format!("extension:{}", input.trim_start_matches('.')))
    }
}

/// Output table name for a code search query
pub fn code_output_name(input: &str) -> String {
    format!("pac_repos_{}.csv", sanitize_label(input))
}

/// Output table name for a topic
pub fn topic_output_name(topic: &str) -> String {
    format!("{}_repos.csv", sanitize_label(topic))
}

// === Sinks ===

/// Receives the new items of every page, durably, before the page is
/// checkpointed.
pub trait ResultSink {
    fn append(&mut self, items: &[SearchItem]) -> Result<()>;
}

/// Single `full_name` column table
pub struct IdTableSink {
    table: TableWriter,
}

impl IdTableSink {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            table: TableWriter::append(path, &[ID_COLUMN])?,
        })
    }
}

impl ResultSink for IdTableSink {
    fn append(&mut self, items: &[SearchItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.table.write_rows(items.iter().map(|item| [item.full_name.as_str()]))
    }
}

/// Full [`RepoRecord`] rows, for repository search hits
pub struct RecordTableSink {
    table: TableWriter,
}

impl RecordTableSink {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            table: TableWriter::append(path, &RepoRecord::COLUMNS)?,
        })
    }
}

impl ResultSink for RecordTableSink {
    fn append(&mut self, items: &[SearchItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let rows = items.iter().map(|item| match &item.record {
            Some(record) => record.to_row(),
            None => RepoRecord {
                full_name: item.full_name.clone(),
                ..Default::default()
            }
            .to_row(),
        });
        self.table.write_rows(rows)
    }
}

// === Engine ===

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub kind: SearchKind,
    pub per_page: u32,
    /// Consecutive abandoned pages after which the query is given up
    pub max_failed_pages: u32,
    pub retry: RetryPolicy,
    /// Ignore and clear existing checkpoints
    pub restart: bool,
}

#[cfg(test)]
impl FetchOptions {
    pub fn new(kind: SearchKind) -> Self {
        Self {
            kind,
            per_page: 100,
            max_failed_pages: 3,
            retry: RetryPolicy::default(),
            restart: false,
        }
    }
}

/// Why a query stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// A page came back empty
    #[default]
    Exhausted,
    /// Retrieved everything the API reported
    Drained,
    /// Reached the 1000-result window
    Window,
    /// Short page
    LastPage,
    /// Permanent error, or too many consecutive abandoned pages
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub pages_fetched: u32,
    pub pages_skipped: u32,
    pub new_items: usize,
    pub stop: StopReason,
}

/// Totals over all (sub-)queries of one collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub total_count: u64,
    pub queries: usize,
    pub failed_queries: usize,
    pub pages_skipped: u32,
    pub new_items: usize,
}

impl CollectStats {
    fn add(&mut self, stats: &FetchStats) {
        self.queries += 1;
        self.pages_skipped += stats.pages_skipped;
        self.new_items += stats.new_items;
        if stats.stop == StopReason::Failed {
            self.failed_queries += 1;
        }
    }
}

/// How to split a query that exceeds the result window
#[derive(Debug, Clone)]
pub struct Partition {
    /// Query text every range qualifier is appended to
    pub base: String,
    pub facet: Facet,
    pub ranges: Vec<PartitionRange>,
}

impl Partition {
    /// Star ranges for a topic query; no range reaches below the star floor
    /// of the unpartitioned query
    pub fn topic(topic: &str, star_splits: &[u64]) -> Self {
        Self {
            base: topic_partition_base(topic),
            facet: Facet::Stars,
            ranges: generate_ranges_from(TOPIC_MIN_STARS, star_splits),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.ranges
            .iter()
            .map(|range| partitioned_query(&self.base, self.facet, range))
            .collect()
    }
}

pub struct SearchEngine<'a> {
    api: &'a dyn SearchApi,
    pacer: &'a dyn Pacer,
    checkpoints: &'a mut dyn CheckpointStore,
    options: FetchOptions,
}

impl<'a> SearchEngine<'a> {
    pub fn new(
        api: &'a dyn SearchApi,
        pacer: &'a dyn Pacer,
        checkpoints: &'a mut dyn CheckpointStore,
        options: FetchOptions,
    ) -> Self {
        Self {
            api,
            pacer,
            checkpoints,
            options,
        }
    }

    async fn request(&self, query: &str, page: u32, per_page: u32) -> Result<SearchPage, ApiError> {
        let api = self.api;
        let kind = self.options.kind;
        retry_request(&self.options.retry, self.pacer, |e| kind.should_retry(e), || {
            api.search(kind, query, page, per_page)
        })
        .await
    }

    /// Cheap `total_count` probe with a page size of 1
    pub async fn probe_total(&self, query: &str) -> Result<u64, ApiError> {
        let page = self.request(query, 1, 1).await?;
        debug!(query, total = page.total_count, "probe");
        Ok(page.total_count)
    }

    /// Drain one query page by page, resuming from its checkpoint.
    ///
    /// Only sink and checkpoint I/O failures are returned as errors; API
    /// failures end or skip pages and are reported in the stats.
    pub async fn fetch_query(
        &mut self,
        query: &str,
        seen: &mut SeenSet,
        sink: &mut dyn ResultSink,
    ) -> Result<FetchStats> {
        let key = checkpoint_key(query);
        if self.options.restart {
            self.checkpoints.clear(&key)?;
        }

        let per_page = self.options.per_page.max(1);
        let mut page = match self.checkpoints.load(&key) {
            Some(last) if last > 0 => {
                info!(query, page = last, "resuming from checkpoint");
                u32::try_from(last).unwrap_or(u32::MAX)
            }
            _ => 1,
        };

        let mut stats = FetchStats::default();
        let mut consecutive_failures = 0;

        loop {
            let offset = u64::from(page - 1) * u64::from(per_page);
            if offset >= RESULT_WINDOW {
                stats.stop = StopReason::Window;
                break;
            }

            let response = match self.request(query, page, per_page).await {
                Ok(response) => response,
                Err(e) if !self.options.kind.should_retry(&e) => {
                    warn!(query, page, error = %e, "search failed, stopping query");
                    stats.stop = StopReason::Failed;
                    break;
                }
                Err(e) => {
                    warn!(query, page, error = %e, "retries exhausted, skipping page");
                    stats.pages_skipped += 1;
                    consecutive_failures += 1;
                    if consecutive_failures >= self.options.max_failed_pages.max(1) {
                        warn!(query, skipped = consecutive_failures, "too many failed pages, stopping query");
                        stats.stop = StopReason::Failed;
                        break;
                    }
                    page += 1;
                    continue;
                }
            };
            consecutive_failures = 0;
            stats.pages_fetched += 1;

            if response.total_count > RESULT_WINDOW && stats.pages_fetched == 1 {
                warn!(
                    query,
                    total = response.total_count,
                    "query exceeds the result window, results past {} are unreachable",
                    RESULT_WINDOW
                );
            }

            let mut items = response.items;
            if items.is_empty() {
                stats.stop = StopReason::Exhausted;
                break;
            }
            let returned = items.len() as u64;
            items.truncate((RESULT_WINDOW - offset) as usize);

            let new_items: Vec<SearchItem> = items
                .into_iter()
                .filter(|item| seen.insert(&item.full_name))
                .collect();

            sink.append(&new_items)?;
            self.checkpoints.save(&key, u64::from(page))?;
            stats.new_items += new_items.len();
            info!(query, page, new = new_items.len(), total = response.total_count, "page stored");

            let retrieved = offset + returned;
            if retrieved >= response.total_count {
                stats.stop = StopReason::Drained;
                break;
            }
            if retrieved >= RESULT_WINDOW {
                stats.stop = StopReason::Window;
                break;
            }
            if returned < u64::from(per_page) {
                stats.stop = StopReason::LastPage;
                break;
            }
            page += 1;
        }

        debug!(query, ?stats, "query finished");
        Ok(stats)
    }

    /// Probe `query` and drain it, splitting it along `partition` when the
    /// probe reports more results than the window holds. All sub-queries
    /// share `seen`, so overlapping ranges never write an item twice.
    pub async fn collect(
        &mut self,
        query: &str,
        partition: Option<&Partition>,
        seen: &mut SeenSet,
        sink: &mut dyn ResultSink,
    ) -> Result<CollectStats> {
        let mut totals = CollectStats::default();

        let split = match self.probe_total(query).await {
            Ok(total) => {
                totals.total_count = total;
                if total == 0 {
                    info!(query, "no results");
                    return Ok(totals);
                }
                total > RESULT_WINDOW
            }
            Err(e) => {
                warn!(query, error = %e, "probe failed, fetching without partitioning");
                false
            }
        };

        let queries = match partition {
            Some(partition) if split => {
                info!(query, total = totals.total_count, ranges = partition.ranges.len(), "partitioning query");
                partition.queries()
            }
            _ => vec![query.to_string()],
        };

        for sub_query in &queries {
            let stats = self.fetch_query(sub_query, seen, sink).await?;
            totals.add(&stats);
        }
        Ok(totals)
    }
}
