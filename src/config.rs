use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MinerError;
use crate::github::DEFAULT_API_URL;
use crate::pacing::RetryPolicy;

const CONFIG_FILE: &str = "repo-miner.toml";

/// Topic synonyms searched by `collect-topics` and matched by `filter`
const DEFAULT_TOPICS: [&str; 18] = [
    "machine-learning",
    "deep-learning",
    "chatbot",
    "deep-neuralnetwork",
    "reinforcement-learning",
    "artificial-intelligence",
    "computer-vision",
    "image-processing",
    "neural-network",
    "image-classification",
    "convolutional-neural-networks",
    "object-detection",
    "machine-intelligence",
    "autonomous-vehicles",
    "autonomous-driving",
    "natural-language-processing",
    "adversarial-machine-learning",
    "tensorflow",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub github: GitHubSettings,
    pub search: SearchSettings,
    pub paths: PathSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitHubSettings {
    pub tokens: Vec<String>,
    pub per_page: u32,
    pub max_retries: u32,
    pub request_delay_ms: u64,
    pub backoff_secs: u64,
    pub max_failed_pages: u32,
    pub api_url: String,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            per_page: 100,
            max_retries: 5,
            request_delay_ms: 1000,
            backoff_secs: 3,
            max_failed_pages: 3,
            api_url: DEFAULT_API_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub topics: Vec<String>,
    pub star_splits: Vec<u64>,
    pub size_splits: Vec<u64>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            topics: DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            star_splits: vec![3, 50, 100, 500, 1000, 5000, 10000],
            size_splits: vec![0, 10, 30, 50, 60, 80, 100, 500, 1000, 5000, 10000],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub data_dir: PathBuf,
    pub progress_dir: PathBuf,
    pub clone_dir: PathBuf,
    pub policies_dir: PathBuf,
    pub readme_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            progress_dir: PathBuf::from("progress"),
            clone_dir: PathBuf::from("data/clone"),
            policies_dir: PathBuf::from("policies"),
            readme_dir: PathBuf::from("output/readmes_raw"),
        }
    }
}

impl Config {
    /// Load from `path`, or from the first default location that exists.
    ///
    /// An explicit path must exist; with no path and no file, defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// `repo-miner.toml` in the working directory, then in the platform config dir
    fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.is_file() {
            return Some(local);
        }
        ProjectDirs::from("dev", "repo-miner", "repo-miner")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .filter(|p| p.is_file())
    }

    pub fn validate(&self) -> Result<(), MinerError> {
        if !(1..=100).contains(&self.github.per_page) {
            return Err(MinerError::Config(format!(
                "github.per_page must be between 1 and 100, got {}",
                self.github.per_page
            )));
        }
        if self.github.max_retries == 0 {
            return Err(MinerError::Config("github.max_retries must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Tokens from the config file, or discovered from the environment
    pub fn tokens(&self) -> Vec<String> {
        let configured: Vec<String> = self
            .github
            .tokens
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if configured.is_empty() {
            discover_tokens()
        } else {
            configured
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.github.max_retries, Duration::from_secs(self.github.backoff_secs))
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.github.request_delay_ms)
    }
}

/// Split a comma separated token list
fn parse_token_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// GitHub tokens from the environment or gh CLI config
pub fn discover_tokens() -> Vec<String> {
    // A pool of tokens, comma separated
    if let Ok(raw) = std::env::var("GITHUB_TOKENS") {
        let tokens = parse_token_list(&raw);
        if !tokens.is_empty() {
            return tokens;
        }
    }

    for var in ["GITHUB_TOKEN", "GH_TOKEN"] {
        if let Ok(token) = std::env::var(var) {
            if !token.trim().is_empty() {
                return vec![token.trim().to_string()];
            }
        }
    }

    // Try to get from gh CLI config
    if let Ok(output) = std::process::Command::new("gh").args(["auth", "token"]).output() {
        if output.status.success() {
            let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !token.is_empty() {
                return vec![token];
            }
        }
    }

    Vec::new()
}
