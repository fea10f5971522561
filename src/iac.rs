//! Infrastructure-as-code usage probes.
//!
//! Each tool is detected with one code search scoped to the repository
//! (`repo:owner/name <query>`, page size 1); any hit means the tool is used.

use anyhow::Result;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::MinerError;
use crate::github::{retry_request, SearchApi, SearchKind};
use crate::pacing::{Pacer, RetryPolicy};
use crate::table::{SeenSet, TableWriter, ID_COLUMN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IacTool {
    pub name: &'static str,
    pub query: &'static str,
}

pub const IAC_TOOLS: [IacTool; 15] = [
    IacTool { name: "docker", query: "filename:Dockerfile" },
    IacTool { name: "ansible", query: "filename:ansible.cfg OR ansible in:path" },
    IacTool { name: "terraform", query: "extension:tf" },
    IacTool { name: "vagrant", query: "filename:Vagrantfile OR vagrant in:path" },
    IacTool { name: "kubernetes", query: "deployment OR kubernetes in:file extension:yaml" },
    IacTool { name: "chef", query: "filename:Policyfile.rb OR cookbooks in:path" },
    IacTool { name: "puppet", query: "extension:pp OR manifests in:path" },
    IacTool { name: "apache_brooklyn", query: "apache-brooklyn in:file OR filename:blueprints.yaml" },
    IacTool { name: "packer", query: "filename:packer.json OR extension:.pkr.hcl" },
    IacTool { name: "cloudformation", query: "AWSTemplateFormatVersion in:file extension:yaml, json" },
    IacTool { name: "tosca", query: "tosca_definitions_version in:file extension:yaml OR filename:service-template.yaml" },
    IacTool { name: "salt", query: "extension:sls OR salt in:file extension:conf" },
    IacTool { name: "cloudify", query: "cloudify in:file extension:yaml OR filename:blueprint.yaml" },
    IacTool { name: "octopus_deploy", query: "octopus in:file OR filename:octopus.config" },
    IacTool { name: "azure_devops", query: "filename:azure-pipelines.yml OR filename:azure-pipelines.yaml" },
];

pub const DEFAULT_TOOLS: [&str; 2] = ["docker", "terraform"];

/// Resolve tool names, keeping table order; unknown names are a config error
pub fn select_tools(names: &[String]) -> Result<Vec<IacTool>, MinerError> {
    let wanted: Vec<String> = names.iter().map(|n| n.trim().to_lowercase()).collect();

    if let Some(unknown) = wanted
        .iter()
        .find(|w| !IAC_TOOLS.iter().any(|t| t.name == w.as_str()))
    {
        return Err(MinerError::Config(format!(
            "unknown IaC tool '{}', expected one of: {}",
            unknown,
            IAC_TOOLS.iter().map(|t| t.name).collect::<Vec<_>>().join(", ")
        )));
    }

    Ok(IAC_TOOLS
        .iter()
        .filter(|t| wanted.iter().any(|w| w == t.name))
        .copied()
        .collect())
}

/// `full_name` followed by one `has_<tool>` column per tool
pub fn columns(tools: &[IacTool]) -> Vec<String> {
    std::iter::once(ID_COLUMN.to_string())
        .chain(tools.iter().map(|t| format!("has_{}", t.name)))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IacStats {
    pub processed: usize,
    pub written: usize,
    pub skipped: usize,
}

pub struct IacProber<'a> {
    api: &'a dyn SearchApi,
    pacer: &'a dyn Pacer,
    retry: RetryPolicy,
}

impl<'a> IacProber<'a> {
    pub fn new(api: &'a dyn SearchApi, pacer: &'a dyn Pacer, retry: RetryPolicy) -> Self {
        Self { api, pacer, retry }
    }

    /// True when the scoped code search reports at least one hit; failures
    /// count as absent
    pub async fn has_tool(&self, full_name: &str, tool: &IacTool) -> bool {
        let api = self.api;
        let query = format!("repo:{} {}", full_name, tool.query);
        let result = retry_request(&self.retry, self.pacer, |e| e.is_transient(), || {
            api.search(SearchKind::Code, &query, 1, 1)
        })
        .await;

        match result {
            Ok(page) => page.total_count > 0,
            Err(e) => {
                warn!(repo = full_name, tool = tool.name, error = %e, "code search probe failed");
                false
            }
        }
    }

    pub async fn probe(&self, full_name: &str, tools: &[IacTool]) -> Vec<bool> {
        let mut found = Vec::with_capacity(tools.len());
        for tool in tools {
            found.push(self.has_tool(full_name, tool).await);
        }
        found
    }

    /// Probe every identifier, resuming after the index stored under `key`
    pub async fn run(
        &self,
        tools: &[IacTool],
        ids: &[String],
        seen: &mut SeenSet,
        out: &mut TableWriter,
        checkpoints: &mut dyn CheckpointStore,
        key: &str,
    ) -> Result<IacStats> {
        let start = checkpoints.load(key).unwrap_or(0) as usize;
        let mut stats = IacStats::default();

        for (idx, full_name) in ids.iter().enumerate().skip(start) {
            let full_name = full_name.trim();
            stats.processed += 1;
            if !full_name.contains('/') || seen.contains(full_name) {
                stats.skipped += 1;
                continue;
            }

            let found = self.probe(full_name, tools).await;
            let row = std::iter::once(full_name.to_string()).chain(found.iter().map(|f| f.to_string()));
            out.write_row(row)?;
            seen.insert(full_name);
            checkpoints.save(key, (idx + 1) as u64)?;
            stats.written += 1;
            info!(repo = full_name, "[{}/{}] probed", idx + 1, ids.len());
        }
        Ok(stats)
    }
}
