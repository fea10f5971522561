//! Policy-as-code artifact detection in cloned repositories.
//!
//! Each file is classified against an ordered rule table: the first rule whose
//! file name suffix matches, and whose keywords (if any) occur in the file
//! content, decides the tool category. Classification produces a stream of
//! [`ToolMatch`]es that a [`MatchSink`] either counts or copies.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::MinerError;
use crate::table::{TableWriter, ID_COLUMN};

/// Policy-as-code tool ecosystems, in output column order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolCategory {
    Sentinel,
    Opa,
    Pulumi,
    Cedar,
    Kyverno,
    CloudCustodian,
    AwsConfig,
    Gatekeeper,
    Kubewarden,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 9] = [
        ToolCategory::Sentinel,
        ToolCategory::Opa,
        ToolCategory::Pulumi,
        ToolCategory::Cedar,
        ToolCategory::Kyverno,
        ToolCategory::CloudCustodian,
        ToolCategory::AwsConfig,
        ToolCategory::Gatekeeper,
        ToolCategory::Kubewarden,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ToolCategory::Sentinel => "HashiCorp Sentinel",
            ToolCategory::Opa => "Open Policy Agent (OPA)",
            ToolCategory::Pulumi => "Pulumi",
            ToolCategory::Cedar => "Cedar Policy Language (CPL)",
            ToolCategory::Kyverno => "Kyverno OSS",
            ToolCategory::CloudCustodian => "Cloud Custodian",
            ToolCategory::AwsConfig => "AWS Config",
            ToolCategory::Gatekeeper => "OpagateKeeper",
            ToolCategory::Kubewarden => "Kubewarden",
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// File name suffixes plus optional content keywords
struct SignatureRule {
    suffixes: &'static [&'static str],
    /// Empty means the name alone decides
    keywords: &'static [&'static str],
    category: ToolCategory,
}

impl SignatureRule {
    const fn new(
        suffixes: &'static [&'static str],
        keywords: &'static [&'static str],
        category: ToolCategory,
    ) -> Self {
        Self { suffixes, keywords, category }
    }

    fn matches_name(&self, lower_name: &str) -> bool {
        self.suffixes.iter().any(|s| lower_name.ends_with(s))
    }

    fn matches_content(&self, content: &str) -> bool {
        self.keywords.iter().any(|k| content.contains(k))
    }
}

const YAML: &[&str] = &[".yaml", ".yml"];

/// Evaluated top to bottom; the broad YAML rules rely on their keywords
static RULES: [SignatureRule; 13] = [
    SignatureRule::new(&[".sentinel"], &[], ToolCategory::Sentinel),
    SignatureRule::new(&[".rego"], &[], ToolCategory::Opa),
    SignatureRule::new(&[".go"], &["pulumi-policy"], ToolCategory::Pulumi),
    SignatureRule::new(&[".py"], &["pulumi_policy"], ToolCategory::Pulumi),
    SignatureRule::new(&[".java"], &["com.pulumi"], ToolCategory::Pulumi),
    SignatureRule::new(&[".js", ".ts"], &["@pulumi"], ToolCategory::Pulumi),
    SignatureRule::new(&[".cedar", ".cedar.json", ".cedarschema.json"], &[], ToolCategory::Cedar),
    SignatureRule::new(YAML, &["ClusterPolicy"], ToolCategory::Kyverno),
    SignatureRule::new(YAML, &["custodian"], ToolCategory::CloudCustodian),
    SignatureRule::new(&[".guard"], &[], ToolCategory::AwsConfig),
    SignatureRule::new(&[".json"], &["PolicyText", "PolicyRuntime"], ToolCategory::AwsConfig),
    SignatureRule::new(YAML, &["ConstraintTemplate"], ToolCategory::Gatekeeper),
    SignatureRule::new(YAML, &["PolicyServer", "ClusterAdmissionPolicy"], ToolCategory::Kubewarden),
];

/// Classify a file by name and, when a rule needs it, content.
///
/// Content is read at most once and decoded lossily; a read failure means no
/// keyword rule can match.
pub fn classify(path: &Path) -> Option<ToolCategory> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();
    classify_with(&name, || match fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "unreadable file");
            None
        }
    })
}

fn classify_with<F>(lower_name: &str, load: F) -> Option<ToolCategory>
where
    F: FnOnce() -> Option<String>,
{
    let mut load = Some(load);
    let mut content: Option<Option<String>> = None;

    for rule in RULES.iter().filter(|r| r.matches_name(lower_name)) {
        if rule.keywords.is_empty() {
            return Some(rule.category);
        }
        let text = content.get_or_insert_with(|| load.take().and_then(|f| f()));
        if text.as_deref().is_some_and(|t| rule.matches_content(t)) {
            return Some(rule.category);
        }
    }
    None
}

/// One classified file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolMatch {
    pub repository: String,
    pub category: ToolCategory,
    pub path: PathBuf,
}

/// Consumes the match stream of a scan
pub trait MatchSink {
    /// Called once per repository before any of its matches
    fn begin_repository(&mut self, _repository: &str) {}

    fn accept(&mut self, found: &ToolMatch) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub repositories: usize,
    pub files: usize,
    pub matches: usize,
}

/// Immediate subdirectories of `root`, sorted by name
pub fn list_repositories(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !root.is_dir() {
        return Err(MinerError::InvalidDirectory(root.to_path_buf()).into());
    }

    let mut repos: Vec<(String, PathBuf)> = fs::read_dir(root)
        .with_context(|| format!("Failed to list {}", root.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
        .collect();
    repos.sort();
    Ok(repos)
}

/// Classify every file under every repository directory of `root`
pub fn scan(root: &Path, sink: &mut dyn MatchSink) -> Result<ScanStats> {
    let mut stats = ScanStats::default();

    for (repository, repo_path) in list_repositories(root)? {
        sink.begin_repository(&repository);
        stats.repositories += 1;

        let files = WalkDir::new(&repo_path)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file());

        for entry in files {
            stats.files += 1;
            if let Some(category) = classify(entry.path()) {
                stats.matches += 1;
                sink.accept(&ToolMatch {
                    repository: repository.clone(),
                    category,
                    path: entry.into_path(),
                })?;
            }
        }
        debug!(repo = %repository, "scanned");
    }
    Ok(stats)
}

// === Counting ===

/// repository → category → matching file count
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    counts: BTreeMap<String, HashMap<ToolCategory, usize>>,
}

impl ScanSummary {
    pub fn count(&self, repository: &str, category: ToolCategory) -> usize {
        self.counts
            .get(repository)
            .and_then(|c| c.get(&category))
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn repositories(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    /// Header: `full_name` plus every category label
    pub fn columns() -> Vec<&'static str> {
        std::iter::once(ID_COLUMN)
            .chain(ToolCategory::ALL.iter().map(|c| c.label()))
            .collect()
    }

    /// One row per repository with every category filled, zeros included
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.counts
            .keys()
            .map(|repo| {
                std::iter::once(repo.clone())
                    .chain(ToolCategory::ALL.iter().map(|c| self.count(repo, *c).to_string()))
                    .collect()
            })
            .collect()
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut table = TableWriter::create(path, &Self::columns())?;
        table.write_rows(self.rows())
    }
}

#[derive(Debug, Default)]
pub struct CountingSink {
    pub summary: ScanSummary,
}

impl MatchSink for CountingSink {
    fn begin_repository(&mut self, repository: &str) {
        self.summary.counts.entry(repository.to_string()).or_default();
    }

    fn accept(&mut self, found: &ToolMatch) -> Result<()> {
        *self
            .summary
            .counts
            .entry(found.repository.clone())
            .or_default()
            .entry(found.category)
            .or_insert(0) += 1;
        Ok(())
    }
}

// === Copying ===

/// Copies every match to `{out}/{category}/{repository}/{file name}`
pub struct CopyingSink {
    out: PathBuf,
    pub copied: usize,
    pub failed: usize,
}

impl CopyingSink {
    pub fn new(out: impl Into<PathBuf>) -> Self {
        Self {
            out: out.into(),
            copied: 0,
            failed: 0,
        }
    }

    fn destination(&self, found: &ToolMatch) -> Option<PathBuf> {
        let file_name = found.path.file_name()?;
        Some(
            self.out
                .join(found.category.label())
                .join(&found.repository)
                .join(file_name),
        )
    }

    fn copy(&self, found: &ToolMatch, dest: &Path) -> std::io::Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&found.path, dest).map(|_| ())
    }
}

impl MatchSink for CopyingSink {
    fn accept(&mut self, found: &ToolMatch) -> Result<()> {
        let Some(dest) = self.destination(found) else {
            return Ok(());
        };
        match self.copy(found, &dest) {
            Ok(()) => self.copied += 1,
            Err(e) => {
                warn!(
                    from = %found.path.display(),
                    to = %dest.display(),
                    error = %e,
                    "could not copy policy file"
                );
                self.failed += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_name_only_rules() {
        assert_eq!(classify_with("main.sentinel", || None), Some(ToolCategory::Sentinel));
        assert_eq!(classify_with("authz.rego", || None), Some(ToolCategory::Opa));
        assert_eq!(classify_with("schema.cedarschema.json", || None), Some(ToolCategory::Cedar));
        assert_eq!(classify_with("rules.guard", || None), Some(ToolCategory::AwsConfig));
        assert_eq!(classify_with("readme.md", || Some("ClusterPolicy".into())), None);
    }

    #[test]
    fn test_keyword_rules() {
        let check = |name: &str, body: &str| classify_with(name, || Some(body.to_string()));

        assert_eq!(check("policy.go", "import \"github.com/pulumi/pulumi-policy\""), Some(ToolCategory::Pulumi));
        assert_eq!(check("policy.py", "from pulumi_policy import"), Some(ToolCategory::Pulumi));
        assert_eq!(check("Policy.java", "import com.pulumi.core"), Some(ToolCategory::Pulumi));
        assert_eq!(check("index.ts", "import * as aws from \"@pulumi/aws\""), Some(ToolCategory::Pulumi));
        assert_eq!(check("index.ts", "console.log(1)"), None);
        assert_eq!(check("policy.yml", "kind: ClusterPolicy"), Some(ToolCategory::Kyverno));
        assert_eq!(check("policy.yaml", "# run with custodian"), Some(ToolCategory::CloudCustodian));
        assert_eq!(check("template.yaml", "kind: ConstraintTemplate"), Some(ToolCategory::Gatekeeper));
        assert_eq!(check("server.yml", "kind: PolicyServer"), Some(ToolCategory::Kubewarden));
        assert_eq!(check("cap.yaml", "kind: ClusterAdmissionPolicy"), Some(ToolCategory::Kubewarden));
        assert_eq!(check("rule.json", "{\"PolicyText\": \"\"}"), Some(ToolCategory::AwsConfig));
        assert_eq!(check("package.json", "{}"), None);
    }

    #[test]
    fn test_keywords_are_case_sensitive_names_are_not() {
        assert_eq!(classify_with("policy.yaml", || Some("kind: clusterpolicy".into())), None);
        assert_eq!(classify_with("main.rego", || None), Some(ToolCategory::Opa));
        // callers lowercase the name before matching
        assert_eq!(classify(Path::new("/nonexistent/MAIN.REGO")), Some(ToolCategory::Opa));
    }

    #[test]
    fn test_first_match_wins() {
        // satisfies both the Kyverno and the Gatekeeper rule
        let body = "kind: ClusterPolicy\n---\nkind: ConstraintTemplate\n";
        assert_eq!(classify_with("both.yaml", || Some(body.into())), Some(ToolCategory::Kyverno));

        // Cedar's name rule sits above the generic JSON keyword rule
        assert_eq!(
            classify_with("policy.cedar.json", || Some("PolicyText".into())),
            Some(ToolCategory::Cedar)
        );
    }

    #[test]
    fn test_content_read_at_most_once() {
        let reads = Cell::new(0);
        let result = classify_with("plain.yaml", || {
            reads.set(reads.get() + 1);
            Some("kind: Deployment".to_string())
        });
        assert_eq!(result, None);
        assert_eq!(reads.get(), 1);

        let reads = Cell::new(0);
        classify_with("main.rego", || {
            reads.set(reads.get() + 1);
            None
        });
        assert_eq!(reads.get(), 0);
    }

    #[test]
    fn test_unreadable_content_is_no_match() {
        assert_eq!(classify_with("policy.yaml", || None), None);
        assert_eq!(classify(Path::new("/nonexistent/dir/policy.yaml")), None);
    }

    #[test]
    fn test_invalid_utf8_is_decoded_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        let mut bytes = vec![0xff, 0xfe, b'\n'];
        bytes.extend_from_slice(b"kind: ClusterPolicy");
        fs::write(&path, bytes).unwrap();

        assert_eq!(classify(&path), Some(ToolCategory::Kyverno));
    }

    #[test]
    fn test_scan_counts_and_default_zero() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "acme__infra/policies/a.rego", "package a");
        write(root.path(), "acme__infra/policies/nested/b.rego", "package b");
        write(root.path(), "acme__infra/k8s/kyverno.yaml", "kind: ClusterPolicy");
        write(root.path(), "acme__infra/k8s/deploy.yaml", "kind: Deployment");
        write(root.path(), "empty__repo/README.md", "# nothing");
        fs::write(root.path().join("stray.rego"), "not in a repo").unwrap();

        let mut sink = CountingSink::default();
        let stats = scan(root.path(), &mut sink).unwrap();

        assert_eq!(stats.repositories, 2);
        assert_eq!(stats.files, 5);
        assert_eq!(stats.matches, 3);

        let summary = &sink.summary;
        assert_eq!(summary.count("acme__infra", ToolCategory::Opa), 2);
        assert_eq!(summary.count("acme__infra", ToolCategory::Kyverno), 1);
        assert_eq!(summary.count("acme__infra", ToolCategory::Pulumi), 0);
        assert_eq!(summary.repositories().collect::<Vec<_>>(), vec!["acme__infra", "empty__repo"]);

        let out = root.path().join("summary.csv");
        summary.write_csv(&out).unwrap();
        let content = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines[0],
            "full_name,HashiCorp Sentinel,Open Policy Agent (OPA),Pulumi,Cedar Policy Language (CPL),\
             Kyverno OSS,Cloud Custodian,AWS Config,OpagateKeeper,Kubewarden"
        );
        assert_eq!(lines[1], "acme__infra,0,2,0,0,1,0,0,0,0");
        assert_eq!(lines[2], "empty__repo,0,0,0,0,0,0,0,0,0");
    }

    #[test]
    fn test_scan_rejects_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let err = scan(&root.path().join("missing"), &mut CountingSink::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<MinerError>(), Some(MinerError::InvalidDirectory(_))));
    }

    #[test]
    fn test_copying_sink_layout() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "clone/acme__infra/policies/a.rego", "package a");
        write(root.path(), "clone/acme__infra/sentinel/deep/limits.sentinel", "main = rule { true }");
        write(root.path(), "clone/acme__infra/app.py", "print(1)");

        let out = root.path().join("policies");
        let mut sink = CopyingSink::new(&out);
        scan(&root.path().join("clone"), &mut sink).unwrap();

        assert_eq!(sink.copied, 2);
        assert_eq!(sink.failed, 0);
        assert_eq!(
            fs::read_to_string(out.join("Open Policy Agent (OPA)/acme__infra/a.rego")).unwrap(),
            "package a"
        );
        assert!(out.join("HashiCorp Sentinel/acme__infra/limits.sentinel").is_file());
        assert!(!out.join("Pulumi").exists());
    }
}
