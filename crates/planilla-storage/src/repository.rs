//! File-backed repositories for the update checkpoint and the institution catalog.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::NaiveDateTime;
use planilla_core::{Institution, CHECKPOINT_FORMAT};
use tokio::fs;
use tracing::warn;

use crate::replace_file_atomically;

const CATALOG_HEADER: &str = "institucion";

async fn read_if_exists(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Last source update that a run has fully attempted.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<Option<NaiveDateTime>> {
        let Some(bytes) = read_if_exists(&self.path).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        // Older checkpoint files were truncated in place and carry NUL padding.
        let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if trimmed.is_empty() {
            warn!(path = %self.path.display(), "checkpoint file is empty; treating as absent");
            return Ok(None);
        }
        NaiveDateTime::parse_from_str(trimmed, CHECKPOINT_FORMAT)
            .map(Some)
            .with_context(|| {
                format!(
                    "parsing checkpoint {:?} in {}",
                    trimmed,
                    self.path.display()
                )
            })
    }

    pub async fn store(&self, value: NaiveDateTime) -> anyhow::Result<()> {
        let text = value.format(CHECKPOINT_FORMAT).to_string();
        replace_file_atomically(&self.path, text.as_bytes())
            .await
            .with_context(|| format!("writing checkpoint {}", self.path.display()))
    }
}

/// Append-only set of institutions ever seen on the portal, kept as a
/// single-column CSV.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<BTreeSet<Institution>> {
        let Some(bytes) = read_if_exists(&self.path).await? else {
            return Ok(BTreeSet::new());
        };

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader
            .headers()
            .with_context(|| format!("reading catalog header {}", self.path.display()))?
            .clone();
        let Some(column) = headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').trim() == CATALOG_HEADER)
        else {
            bail!(
                "catalog {} has no `{CATALOG_HEADER}` column",
                self.path.display()
            );
        };

        let mut catalog = BTreeSet::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| {
                format!("reading catalog row {} of {}", line + 2, self.path.display())
            })?;
            if let Some(name) = record.get(column).map(str::trim).filter(|s| !s.is_empty()) {
                catalog.insert(Institution::new(name));
            }
        }
        Ok(catalog)
    }

    pub async fn store(&self, catalog: &BTreeSet<Institution>) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record([CATALOG_HEADER])
            .context("writing catalog header")?;
        for institution in catalog {
            writer
                .write_record([institution.name()])
                .with_context(|| format!("writing catalog row {institution}"))?;
        }
        let bytes = writer.into_inner().context("finishing catalog csv")?;
        replace_file_atomically(&self.path, &bytes)
            .await
            .with_context(|| format!("writing catalog {}", self.path.display()))
    }

    /// Union `discovered` into the persisted catalog and persist the result.
    pub async fn merge(
        &self,
        discovered: impl IntoIterator<Item = Institution>,
    ) -> anyhow::Result<BTreeSet<Institution>> {
        let mut catalog = self.load().await?;
        catalog.extend(discovered);
        self.store(&catalog).await?;
        Ok(catalog)
    }
}
