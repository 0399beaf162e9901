//! Reference genome lookup and download.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::command::{run_command, CommandError, CommandExecutor, ExternalCommand, SyncRunner};

/// Default location of packaged reference archives.
pub const DEFAULT_REFERENCE_PREFIX: &str = "s3://reference-genomes/cellranger";

const ARCHIVE_EXTENSION: &str = "tgz";

/// Errors while resolving a reference genome.
#[derive(Debug, Error)]
pub enum ReferenceError {
    /// The taxon has no catalogued reference.
    #[error("no reference genome for taxon {taxon:?} (known: {known})")]
    UnknownTaxon {
        /// Requested taxon.
        taxon: String,
        /// Comma separated list of known taxa.
        known: String,
    },

    /// Downloading or unpacking the archive failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Local filesystem failure.
    #[error("failed to {operation} {path}: {source}")]
    Io {
        /// What was being done.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
}

/// Taxon → packaged reference name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceCatalog {
    genomes: BTreeMap<String, String>,
}

impl Default for ReferenceCatalog {
    fn default() -> Self {
        Self::from_entries([
            ("homo", "GRCh38-2020-A-2.0.0"),
            ("mus", "mm10-2020-A-2.0.0"),
        ])
    }
}

impl ReferenceCatalog {
    /// Catalog built from `(taxon, reference)` pairs.
    pub fn from_entries<I, T, R>(entries: I) -> Self
    where
        I: IntoIterator<Item = (T, R)>,
        T: Into<String>,
        R: Into<String>,
    {
        Self {
            genomes: entries
                .into_iter()
                .map(|(taxon, reference)| (taxon.into(), reference.into()))
                .collect(),
        }
    }

    /// Reference name for `taxon`.
    pub fn lookup(&self, taxon: &str) -> Result<&str, ReferenceError> {
        self.genomes
            .get(taxon)
            .map(String::as_str)
            .ok_or_else(|| ReferenceError::UnknownTaxon {
                taxon: taxon.to_string(),
                known: self.taxa().collect::<Vec<_>>().join(", "),
            })
    }

    /// Known taxa in sorted order.
    pub fn taxa(&self) -> impl Iterator<Item = &str> {
        self.genomes.keys().map(String::as_str)
    }
}

/// Prepares a reference genome for a taxon inside a local directory.
pub trait ReferenceResolver {
    /// Make the reference for `taxon` available under `genome_dir` and
    /// return its path.
    fn resolve<E: CommandExecutor>(
        &self,
        taxon: &str,
        genome_dir: &Path,
        runner: &SyncRunner<E>,
    ) -> Result<PathBuf, ReferenceError>;
}

impl<R: ReferenceResolver + ?Sized> ReferenceResolver for &R {
    fn resolve<E: CommandExecutor>(
        &self,
        taxon: &str,
        genome_dir: &Path,
        runner: &SyncRunner<E>,
    ) -> Result<PathBuf, ReferenceError> {
        (**self).resolve(taxon, genome_dir, runner)
    }
}

/// Fetches `<prefix>/<reference>.tgz`, unpacks it into the genome directory
/// and deletes the archive.
#[derive(Debug, Clone)]
pub struct RemoteArchiveResolver {
    catalog: ReferenceCatalog,
    prefix: String,
}

impl Default for RemoteArchiveResolver {
    fn default() -> Self {
        Self::new(ReferenceCatalog::default(), DEFAULT_REFERENCE_PREFIX)
    }
}

impl RemoteArchiveResolver {
    /// Resolver over `catalog` with archives stored under `prefix`.
    pub fn new(catalog: ReferenceCatalog, prefix: impl Into<String>) -> Self {
        Self {
            catalog,
            prefix: prefix.into(),
        }
    }

    /// Catalog in use.
    pub fn catalog(&self) -> &ReferenceCatalog {
        &self.catalog
    }

    /// Remote URI of the archive for `reference`.
    pub fn archive_uri(&self, reference: &str) -> String {
        format!(
            "{}/{reference}.{ARCHIVE_EXTENSION}",
            self.prefix.trim_end_matches('/')
        )
    }
}

impl ReferenceResolver for RemoteArchiveResolver {
    fn resolve<E: CommandExecutor>(
        &self,
        taxon: &str,
        genome_dir: &Path,
        runner: &SyncRunner<E>,
    ) -> Result<PathBuf, ReferenceError> {
        let reference = self.catalog.lookup(taxon)?;
        let archive = genome_dir.join(format!("{reference}.{ARCHIVE_EXTENSION}"));
        info!(taxon, reference, dir = %genome_dir.display(), "fetching reference genome");

        runner.cp(&self.archive_uri(reference), &archive.to_string_lossy())?;

        let extract = ExternalCommand::new("tar")
            .arg("-xzf")
            .arg(archive.to_string_lossy())
            .arg("-C")
            .arg(genome_dir.to_string_lossy());
        run_command(
            runner.executor(),
            &extract,
            &format!("failed to unpack reference {reference}"),
        )?;

        fs::remove_file(&archive).map_err(|source| ReferenceError::Io {
            operation: "remove archive",
            path: archive.clone(),
            source,
        })?;

        Ok(genome_dir.join(reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_taxon_lists_known_ones() {
        let err = ReferenceCatalog::default().lookup("danio").unwrap_err();
        assert_eq!(
            err.to_string(),
            "no reference genome for taxon \"danio\" (known: homo, mus)"
        );
    }

    #[test]
    fn archive_uri_joins_prefix() {
        let resolver = RemoteArchiveResolver::new(ReferenceCatalog::default(), "s3://refs/");
        assert_eq!(resolver.archive_uri("mm10"), "s3://refs/mm10.tgz");
    }
}
