//! Row-oriented CSV tables: append-only writers, column readers, and the
//! seen-set used to deduplicate identifiers across pages and runs.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::MinerError;

/// Column holding the unique repository identifier in every table
pub const ID_COLUMN: &str = "full_name";

/// Bytes read per step while looking for the last complete row
const TAIL_CHUNK: u64 = 8 * 1024;

/// Read every value of `column` from a CSV file with a header row.
///
/// Fails with [`MinerError::MissingColumn`] when the header lacks the column,
/// so callers can abort before any work starts.
pub fn read_column(path: &Path, column: &str) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open table: {}", path.display()))?;

    let idx = column_index(&mut reader, path, column)?;

    let mut values = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("Failed to read row in {}", path.display()))?;
        if let Some(value) = record.get(idx) {
            values.push(value.to_string());
        }
    }
    Ok(values)
}

fn column_index(reader: &mut csv::Reader<File>, path: &Path, column: &str) -> Result<usize> {
    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?;
    headers
        .iter()
        .position(|h| h.trim() == column)
        .ok_or_else(|| {
            MinerError::MissingColumn {
                path: path.to_path_buf(),
                column: column.to_string(),
            }
            .into()
        })
}

/// Read the identifier column, dropping blanks and duplicates while keeping
/// first-seen order.
pub fn read_identifiers(path: &Path, column: &str) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    Ok(read_column(path, column)?
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect())
}

/// Unique identifiers already written for one logical collection run
#[derive(Debug, Default, Clone)]
pub struct SeenSet {
    ids: HashSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a previous (possibly partial) output table.
    ///
    /// A missing file is an empty set. A file without the id column is a
    /// structural error. Rows that fail to parse are skipped, so a torn final
    /// line from a crash does not block resumption.
    pub fn rehydrate(path: &Path, column: &str) -> Result<Self> {
        if !path.exists() || fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true) {
            return Ok(Self::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open table: {}", path.display()))?;
        let idx = column_index(&mut reader, path, column)?;

        let ids = reader
            .records()
            .filter_map(|r| r.ok())
            .filter_map(|r| r.get(idx).map(|v| v.trim().to_string()))
            .filter(|v| !v.is_empty())
            .collect();
        Ok(Self { ids })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns true when `id` was not present before
    pub fn insert(&mut self, id: &str) -> bool {
        self.ids.insert(id.to_string())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Append-only CSV writer. The header is written only when the file is new
/// or empty, and every append is flushed before returning.
pub struct TableWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl TableWriter {
    pub fn append(path: &Path, header: &[&str]) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        trim_torn_row(path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open table for append: {}", path.display()))?;
        let is_empty = file.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_empty {
            writer.write_record(header)?;
            writer.flush()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Truncate and start a fresh table
    pub fn create(path: &Path, header: &[&str]) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to replace table: {}", path.display()))?;
        }
        Self::append(path, header)
    }

    pub fn write_row<I, S>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.write_rows(std::iter::once(row))
    }

    /// Write several rows and flush once
    pub fn write_rows<R, I, S>(&mut self, rows: R) -> Result<()>
    where
        R: IntoIterator<Item = I>,
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        for row in rows {
            self.writer
                .write_record(row)
                .with_context(|| format!("Failed to write row to {}", self.path.display()))?;
        }
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {}", self.path.display()))?;
        Ok(())
    }
}

/// Cut a final row that an interrupted write left without its newline, so
/// the next append starts on a fresh line. A file with no complete line at
/// all is emptied and gets its header rewritten.
fn trim_torn_row(path: &Path) -> Result<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to open table: {}", path.display())),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut end = len;
    let mut buf = Vec::new();
    let keep = loop {
        let start = end.saturating_sub(TAIL_CHUNK);
        buf.resize((end - start) as usize, 0);
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;

        if end == len && buf.last() == Some(&b'\n') {
            return Ok(());
        }
        if let Some(pos) = buf.iter().rposition(|b| *b == b'\n') {
            break start + pos as u64 + 1;
        }
        if start == 0 {
            break 0;
        }
        end = start;
    };

    warn!(path = %path.display(), dropped = len - keep, "dropping torn final row");
    file.set_len(keep)
        .with_context(|| format!("Failed to truncate {}", path.display()))?;
    Ok(())
}

/// Column label for a presence table: file stem without the `pac_repos_` prefix
pub fn presence_label(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.strip_prefix("pac_repos_").unwrap_or(&stem).to_string()
}

/// Outer-join identifier tables into `full_name,has_<label>...` with
/// `true`/`false` flags, keeping first-seen order.
pub fn merge_presence(inputs: &[(String, PathBuf)], out: &Path) -> Result<usize> {
    let mut order: Vec<String> = Vec::new();
    let mut listed: HashSet<String> = HashSet::new();
    let mut sets: Vec<HashSet<String>> = Vec::with_capacity(inputs.len());

    for (_, path) in inputs {
        let ids = read_identifiers(path, ID_COLUMN)?;
        for id in &ids {
            if listed.insert(id.clone()) {
                order.push(id.clone());
            }
        }
        sets.push(ids.into_iter().collect());
    }

    let header: Vec<String> = std::iter::once(ID_COLUMN.to_string())
        .chain(inputs.iter().map(|(label, _)| format!("has_{}", label)))
        .collect();
    let header: Vec<&str> = header.iter().map(String::as_str).collect();

    let mut table = TableWriter::create(out, &header)?;
    table.write_rows(order.iter().map(|id| {
        std::iter::once(id.clone()).chain(sets.iter().map(move |s| s.contains(id.as_str()).to_string()))
    }))?;
    Ok(order.len())
}
