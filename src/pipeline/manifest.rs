//! Library manifest rewriting.
//!
//! Each data row names a remote FASTQ folder (column 0), a sample id
//! (column 1) and a method (last column). The folder is synced to
//! `<data_dir>/<md5(source)>/<sample>/<method>` and the row is rewritten to
//! point at the local copy. The header line is preserved byte for byte.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::command::{CommandExecutor, SyncRunner};

use super::PipelineError;

/// Errors in manifest contents.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest has no header line.
    #[error("manifest is empty")]
    Empty,

    /// A data row lacks the source and sample columns.
    #[error("manifest line {line} has {found} columns, need at least 2")]
    MissingColumns {
        /// 1-based line number in the manifest.
        line: u64,
        /// Columns found.
        found: usize,
    },

    /// Malformed CSV.
    #[error("malformed manifest: {0}")]
    Csv(#[from] csv::Error),

    /// A rewritten row could not be encoded.
    #[error("failed to encode manifest row: {0}")]
    Encode(#[source] io::Error),
}

/// One data row and where its inputs are staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedLibrary {
    /// Remote folder the row originally pointed at.
    pub source: String,
    /// Local directory the folder is synced into.
    pub local_path: PathBuf,
    /// Rewritten row, without the line terminator.
    pub row: String,
}

/// Parsed manifest with every row's staging location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPlan {
    /// Header line, including its line terminator if it had one.
    pub header: String,
    /// Data rows in input order.
    pub libraries: Vec<StagedLibrary>,
}

impl ManifestPlan {
    /// Plan the rewrite of `contents` against `data_dir`.
    pub fn parse(contents: &str, data_dir: &Path) -> Result<Self, ManifestError> {
        let header_len = match contents.find('\n') {
            Some(newline) => newline + 1,
            None if contents.is_empty() => return Err(ManifestError::Empty),
            None => contents.len(),
        };
        let (header, body) = contents.split_at(header_len);

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(body.as_bytes());

        let mut libraries = Vec::new();
        for record in reader.records() {
            let record = record?;
            let line = record.position().map_or(0, |pos| pos.line()) + 1;
            let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
            if fields.len() < 2 {
                return Err(ManifestError::MissingColumns {
                    line,
                    found: fields.len(),
                });
            }

            let source = fields[0].clone();
            let last = fields.len() - 1;
            fields[last] = fields[last].replace(' ', "_");
            let local_path = staging_dir(data_dir, &source, &fields[1], &fields[last]);
            fields[0] = local_path.to_string_lossy().into_owned();

            libraries.push(StagedLibrary {
                source,
                local_path,
                row: encode_row(&fields)?,
            });
        }

        Ok(Self {
            header: header.to_string(),
            libraries,
        })
    }

    /// Rewritten manifest text; every data row ends with a newline.
    pub fn render(&self) -> String {
        let mut out = self.header.clone();
        for library in &self.libraries {
            out.push_str(&library.row);
            out.push('\n');
        }
        out
    }
}

/// One CSV row without its terminator; fields are quoted only when needed.
fn encode_row(fields: &[String]) -> Result<String, ManifestError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .quote_style(csv::QuoteStyle::Necessary)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    let bytes = writer
        .into_inner()
        .map_err(|err| ManifestError::Encode(err.into_error()))?;
    let row = String::from_utf8_lossy(&bytes);
    Ok(row.strip_suffix('\n').unwrap_or(&*row).to_string())
}

/// `<data_dir>/<md5(source)>/<sample_id>/<method>`.
pub fn staging_dir(data_dir: &Path, source: &str, sample_id: &str, method: &str) -> PathBuf {
    let digest = md5::compute(source.as_bytes());
    data_dir
        .join(format!("{digest:x}"))
        .join(sample_id)
        .join(method)
}

/// Sync every library in `original` to its staging directory and write the
/// rewritten manifest to `rewritten`. Stops at the first failed sync.
pub fn process_libraries<E: CommandExecutor>(
    original: &Path,
    rewritten: &Path,
    data_dir: &Path,
    runner: &SyncRunner<E>,
) -> Result<ManifestPlan, PipelineError> {
    let contents =
        fs::read_to_string(original).map_err(|source| io_error("read", original, source))?;
    let plan = ManifestPlan::parse(&contents, data_dir)?;
    info!(libraries = plan.libraries.len(), manifest = %original.display(), "staging inputs");

    for library in &plan.libraries {
        runner.sync(&library.source, &library.local_path.to_string_lossy())?;
    }

    fs::write(rewritten, plan.render()).map_err(|source| io_error("write", rewritten, source))?;
    Ok(plan)
}

fn io_error(operation: &'static str, path: &Path, source: io::Error) -> PipelineError {
    PipelineError::Io {
        operation,
        path: path.to_path_buf(),
        source,
    }
}
