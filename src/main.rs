mod checkpoint;
mod clone;
mod config;
mod enrich;
mod error;
mod github;
mod iac;
mod pacing;
mod partition;
mod readme;
mod scanner;
mod search;
mod table;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use checkpoint::{sanitize_label, CheckpointField, JsonCheckpointStore};
use config::Config;
use enrich::{EnrichJob, Enricher};
use github::{GitHubClient, SearchKind, TokenPool};
use pacing::IntervalPacer;
use partition::{generate_ranges, Facet};
use scanner::{CopyingSink, CountingSink};
use search::{FetchOptions, IdTableSink, Partition, RecordTableSink, SearchEngine};
use table::{SeenSet, TableWriter, ID_COLUMN};

#[derive(Parser)]
#[command(name = "repo-miner", version)]
#[command(about = "Mine GitHub for repositories and scan clones for policy-as-code artifacts")]
#[command(after_help = "\x1b[36mExamples:\x1b[0m
  repo-miner collect-topics -t mlops          # Repository search per topic
  repo-miner collect-code rego                # Code search for extension:rego
  repo-miner enrich data/pac_repos_rego.csv data/enriched.csv
  repo-miner clone data/enriched.csv          # git clone into data/clone
  repo-miner scan data/clone summary.csv      # Count PaC files per repository")]
struct Cli {
    /// Config file (default: ./repo-miner.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Repository search for every configured topic, split by star ranges
    CollectTopics {
        /// Only these topics (default: all configured topics)
        #[arg(short, long)]
        topic: Vec<String>,

        /// Ignore saved page checkpoints
        #[arg(long)]
        restart: bool,
    },

    /// Code search for a file extension (e.g. "rego") or a raw query, split by file size
    CollectCode {
        query: String,

        /// Ignore saved page checkpoints
        #[arg(long)]
        restart: bool,
    },

    /// Outer-join two full_name tables into has_<a>/has_<b> flags
    Merge {
        first: PathBuf,
        second: PathBuf,

        #[arg(short, long)]
        out: PathBuf,
    },

    /// Fetch repository metadata for every identifier
    Enrich {
        input: PathBuf,
        output: PathBuf,

        /// Identifier column in the input
        #[arg(long, default_value = ID_COLUMN)]
        column: String,
    },

    /// Count contributors (anonymous included) per repository
    Contributors {
        input: PathBuf,
        output: PathBuf,

        #[arg(long, default_value = ID_COLUMN)]
        column: String,
    },

    /// Oldest and newest commit dates on the first commits page
    Commits {
        input: PathBuf,
        output: PathBuf,

        #[arg(long, default_value = ID_COLUMN)]
        column: String,
    },

    /// Detect infrastructure-as-code tools with scoped code searches
    Iac {
        input: PathBuf,
        output: PathBuf,

        /// Comma separated tool names (default: docker,terraform)
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,

        #[arg(long, default_value = ID_COLUMN)]
        column: String,
    },

    /// Keep repositories whose name, description, or topics mention a keyword
    Filter {
        input: PathBuf,
        output: PathBuf,

        #[arg(long, default_value = "project_name")]
        column: String,

        /// Keywords (default: configured topics)
        #[arg(short, long)]
        keyword: Vec<String>,
    },

    /// git clone every repository into the clone directory
    #[command(name = "clone")]
    CloneRepos {
        input: PathBuf,

        /// Target directory (default: paths.clone_dir)
        #[arg(long)]
        dir: Option<PathBuf>,

        #[arg(long, default_value = ID_COLUMN)]
        column: String,

        /// Pause between clones
        #[arg(long, default_value = "1000")]
        delay_ms: u64,
    },

    /// Count policy-as-code files per cloned repository
    Scan { root: PathBuf, out: PathBuf },

    /// Copy policy-as-code files into <out>/<tool>/<repository>/
    Extract {
        root: PathBuf,

        /// Output root (default: paths.policies_dir)
        out: Option<PathBuf>,
    },

    /// Save each repository's README as <out>/<repository>.txt
    Readmes {
        root: PathBuf,

        /// Output directory (default: paths.readme_dir)
        out: Option<PathBuf>,
    },

    /// Check GitHub API rate limit
    RateLimit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::CollectTopics { topic, restart } => {
            let topics = if topic.is_empty() { config.search.topics.clone() } else { topic };
            collect_topics(&config, &topics, restart).await
        }
        Commands::CollectCode { query, restart } => collect_code(&config, &query, restart).await,
        Commands::Merge { first, second, out } => merge(&first, &second, &out),
        Commands::Enrich { input, output, column } => {
            run_job(&config, EnrichJob::Metadata, &input, &output, &column).await
        }
        Commands::Contributors { input, output, column } => {
            run_job(&config, EnrichJob::Contributors, &input, &output, &column).await
        }
        Commands::Commits { input, output, column } => {
            run_job(&config, EnrichJob::Commits, &input, &output, &column).await
        }
        Commands::Filter { input, output, column, keyword } => {
            let keywords = if keyword.is_empty() { config.search.topics.clone() } else { keyword };
            run_job(&config, EnrichJob::Filter { keywords }, &input, &output, &column).await
        }
        Commands::Iac { input, output, tools, column } => {
            detect_iac(&config, &input, &output, &tools, &column).await
        }
        Commands::CloneRepos { input, dir, column, delay_ms } => {
            let dir = dir.unwrap_or_else(|| config.paths.clone_dir.clone());
            clone_repos(&input, dir, &column, Duration::from_millis(delay_ms)).await
        }
        Commands::Scan { root, out } => scan_usage(&root, &out),
        Commands::Extract { root, out } => {
            let out = out.unwrap_or_else(|| config.paths.policies_dir.clone());
            extract_policies(&root, &out)
        }
        Commands::Readmes { root, out } => {
            let out = out.unwrap_or_else(|| config.paths.readme_dir.clone());
            save_readmes(&root, &out)
        }
        Commands::RateLimit => check_rate_limit(&config).await,
    }
}

/// stderr logging, plus a plain-text copy in `log_file` when given
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("repo_miner=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repo_miner=info"))
    };

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();
    Ok(())
}

fn github_client(config: &Config) -> Result<GitHubClient> {
    let pool = TokenPool::new(config.tokens());
    if pool.is_empty() {
        eprintln!("\x1b[33m..\x1b[0m No GitHub token found. Rate limit: 60 req/hour, code search unavailable");
        eprintln!("  Set GITHUB_TOKEN, list tokens in repo-miner.toml, or run: gh auth login");
    }
    Ok(GitHubClient::new(&config.github.api_url, Arc::new(pool))?)
}

fn fetch_options(config: &Config, kind: SearchKind, restart: bool) -> FetchOptions {
    FetchOptions {
        kind,
        per_page: config.github.per_page,
        max_failed_pages: config.github.max_failed_pages,
        retry: config.retry_policy(),
        restart,
    }
}

/// Repository search per topic into `{data_dir}/{topic}_repos.csv`
async fn collect_topics(config: &Config, topics: &[String], restart: bool) -> Result<()> {
    let client = github_client(config)?;
    let pacer = IntervalPacer::new(config.request_delay());
    let mut store = JsonCheckpointStore::new(&config.paths.progress_dir, CheckpointField::LastPage);
    let options = fetch_options(config, SearchKind::Repositories, restart);

    for topic in topics {
        let path = config.paths.data_dir.join(search::topic_output_name(topic));
        // opening the sink first drops a torn final row before rehydrating
        let mut sink = RecordTableSink::open(&path)?;
        let mut seen = SeenSet::rehydrate(&path, ID_COLUMN)?;
        let partition = Partition::topic(topic, &config.search.star_splits);

        if seen.is_empty() {
            eprintln!("\x1b[36m..\x1b[0m Collecting topic {}", topic);
        } else {
            eprintln!("\x1b[36m..\x1b[0m Collecting topic {} ({} already stored)", topic, seen.len());
        }
        let stats = {
            let mut engine = SearchEngine::new(&client, &pacer, &mut store, options);
            engine
                .collect(&search::topic_query(topic), Some(&partition), &mut seen, &mut sink)
                .await?
        };

        eprintln!(
            "\x1b[32mok\x1b[0m {} +{} new, {} unique ({} queries, {} failed, {} pages skipped)",
            topic, stats.new_items, seen.len(), stats.queries, stats.failed_queries, stats.pages_skipped
        );
    }
    Ok(())
}

/// Code search into `{data_dir}/pac_repos_{label}.csv`
async fn collect_code(config: &Config, input: &str, restart: bool) -> Result<()> {
    let query = search::code_query(input)?;
    let path = config.paths.data_dir.join(search::code_output_name(input));

    let client = github_client(config)?;
    let pacer = IntervalPacer::new(config.request_delay());
    let mut store = JsonCheckpointStore::new(&config.paths.progress_dir, CheckpointField::LastPage);
    let mut sink = IdTableSink::open(&path)?;
    let mut seen = SeenSet::rehydrate(&path, ID_COLUMN)?;
    let partition = Partition {
        base: query.clone(),
        facet: Facet::Size,
        ranges: generate_ranges(&config.search.size_splits),
    };

    eprintln!("\x1b[36m..\x1b[0m Searching code: {} ({} already stored)", query, seen.len());
    let stats = {
        let options = fetch_options(config, SearchKind::Code, restart);
        let mut engine = SearchEngine::new(&client, &pacer, &mut store, options);
        engine.collect(&query, Some(&partition), &mut seen, &mut sink).await?
    };

    eprintln!(
        "\x1b[32mok\x1b[0m {} reported, +{} new, {} unique in {}",
        stats.total_count,
        stats.new_items,
        seen.len(),
        path.display()
    );
    if stats.failed_queries > 0 || stats.pages_skipped > 0 {
        eprintln!(
            "  \x1b[33m!\x1b[0m {} queries stopped early, {} pages skipped; re-run to retry",
            stats.failed_queries, stats.pages_skipped
        );
    }
    Ok(())
}

fn merge(first: &Path, second: &Path, out: &Path) -> Result<()> {
    let inputs = vec![
        (table::presence_label(first), first.to_path_buf()),
        (table::presence_label(second), second.to_path_buf()),
    ];
    let rows = table::merge_presence(&inputs, out)?;
    eprintln!("\x1b[32mok\x1b[0m Merged {} repositories into {}", rows, out.display());
    Ok(())
}

/// Checkpoint key for an index-resumable job writing `output`
fn job_key(job: &str, output: &Path) -> String {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}-{}", job, sanitize_label(&stem))
}

async fn run_job(config: &Config, job: EnrichJob, input: &Path, output: &Path, column: &str) -> Result<()> {
    // fails on a missing column before any request is made
    let ids = table::read_identifiers(input, column)?;
    let mut out = TableWriter::append(output, &job.columns())?;
    let mut seen = SeenSet::rehydrate(output, ID_COLUMN)?;
    let mut store = JsonCheckpointStore::new(&config.paths.progress_dir, CheckpointField::LastProcessedIndex);

    let client = github_client(config)?;
    let pacer = IntervalPacer::new(config.request_delay());
    let enricher = Enricher::new(&client, &pacer, config.retry_policy());

    eprintln!("\x1b[36m..\x1b[0m {}: {} repositories from {}", job.name(), ids.len(), input.display());
    let key = job_key(job.name(), output);
    let stats = enricher.run(&job, &ids, &mut seen, &mut out, &mut store, &key).await?;

    eprintln!(
        "\x1b[32mok\x1b[0m {}: {} written, {} skipped, {} failed -> {}",
        job.name(),
        stats.written,
        stats.skipped,
        stats.failed,
        output.display()
    );
    Ok(())
}

async fn detect_iac(config: &Config, input: &Path, output: &Path, tools: &[String], column: &str) -> Result<()> {
    let tools = if tools.is_empty() {
        iac::select_tools(&iac::DEFAULT_TOOLS.map(String::from))?
    } else {
        iac::select_tools(tools)?
    };
    let ids = table::read_identifiers(input, column)?;

    let header = iac::columns(&tools);
    let header: Vec<&str> = header.iter().map(String::as_str).collect();
    let mut out = TableWriter::append(output, &header)?;
    let mut seen = SeenSet::rehydrate(output, ID_COLUMN)?;
    let mut store = JsonCheckpointStore::new(&config.paths.progress_dir, CheckpointField::LastProcessedIndex);

    let client = github_client(config)?;
    let pacer = IntervalPacer::new(config.request_delay());
    let prober = iac::IacProber::new(&client, &pacer, config.retry_policy());

    eprintln!(
        "\x1b[36m..\x1b[0m Probing {} repositories for {}",
        ids.len(),
        tools.iter().map(|t| t.name).collect::<Vec<_>>().join(", ")
    );
    let stats = prober
        .run(&tools, &ids, &mut seen, &mut out, &mut store, &job_key("iac", output))
        .await?;

    eprintln!(
        "\x1b[32mok\x1b[0m {} probed, {} skipped -> {}",
        stats.written,
        stats.skipped,
        output.display()
    );
    Ok(())
}

async fn clone_repos(input: &Path, dir: PathBuf, column: &str, delay: Duration) -> Result<()> {
    let ids = table::read_identifiers(input, column)?;
    eprintln!("\x1b[36m..\x1b[0m Cloning {} repositories into {}", ids.len(), dir.display());

    let stats = clone::clone_all_blocking(clone::GitCli, ids, dir, delay).await?;
    eprintln!(
        "\x1b[32mok\x1b[0m {} cloned, {} already present, {} failed",
        stats.cloned, stats.skipped, stats.failed
    );
    Ok(())
}

fn scan_usage(root: &Path, out: &Path) -> Result<()> {
    let mut sink = CountingSink::default();
    let stats = scanner::scan(root, &mut sink)?;
    sink.summary.write_csv(out)?;

    eprintln!(
        "\x1b[32mok\x1b[0m {} repositories, {} files, {} policy files -> {}",
        stats.repositories,
        stats.files,
        stats.matches,
        out.display()
    );
    Ok(())
}

fn extract_policies(root: &Path, out: &Path) -> Result<()> {
    let mut sink = CopyingSink::new(out);
    let stats = scanner::scan(root, &mut sink)?;

    eprintln!(
        "\x1b[32mok\x1b[0m Copied {} policy files from {} repositories into {}",
        sink.copied,
        stats.repositories,
        out.display()
    );
    if sink.failed > 0 {
        eprintln!("  \x1b[33m!\x1b[0m {} files could not be copied", sink.failed);
    }
    Ok(())
}

fn save_readmes(root: &Path, out: &Path) -> Result<()> {
    let stats = readme::extract_readmes(root, out)?;
    eprintln!(
        "\x1b[32mok\x1b[0m Saved {} READMEs into {} ({} repositories without one)",
        stats.saved,
        out.display(),
        stats.missing
    );
    Ok(())
}

async fn check_rate_limit(config: &Config) -> Result<()> {
    let client = github_client(config)?;
    let resources = client.rate_limit().await?;

    eprintln!("\x1b[36mGitHub API Rate Limit\x1b[0m\n");
    for (name, rate) in [("core", &resources.core), ("search", &resources.search)] {
        let reset_time = chrono::DateTime::from_timestamp(rate.reset as i64, 0)
            .map(|dt| dt.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "?".to_string());
        eprintln!(
            "  \x1b[90m{:<7}\x1b[0m {}/{} remaining, resets at {}",
            name, rate.remaining, rate.limit, reset_time
        );
    }
    Ok(())
}
