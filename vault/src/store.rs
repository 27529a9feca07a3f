//! Encrypted data manager
//!
//! Maps logical dataset ids ("enero", "january-sales") to sealed files
//! `<sealed_dir>/<dataset_id>.<extension>`. Only sealed bytes ever reach the
//! filesystem: writes go to a sibling temp file that is synced and renamed
//! over the target, so readers see either the old sealed file or the new
//! one. Loads hand back an [`UnsealedBuffer`] that lives in memory only.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::buffer::UnsealedBuffer;
use crate::cipher::{CipherEngine, SealedRecord};
use crate::config::StorageConfig;
use crate::error::{CipherError, StorageError, StorageResult};
use crate::key_provider::KeyProvider;
use crate::metrics::MetricsCollector;

/// Outcome of sealing a directory of source files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    /// Datasets sealed, with their sealed file
    pub sealed: Vec<(String, PathBuf)>,

    /// Source files that could not be sealed
    pub failed: Vec<IngestFailure>,
}

/// One source file that could not be sealed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestFailure {
    pub source: PathBuf,
    pub reason: String,
}

/// Sealed dataset storage
pub struct SealedStore {
    config: StorageConfig,
    keys: Arc<KeyProvider>,
    cipher: CipherEngine,
    dataset_id_regex: Regex,
    metrics: Option<Arc<MetricsCollector>>,
}

impl SealedStore {
    /// Create a store, making sure the sealed directory exists
    pub fn new(config: StorageConfig, keys: Arc<KeyProvider>) -> StorageResult<Self> {
        fs::create_dir_all(&config.sealed_dir)
            .map_err(|_| StorageError::DirectoryCreationFailed {
                path: config.sealed_dir.to_string_lossy().to_string()
            })?;

        let dataset_id_regex = Regex::new(r"^[a-z0-9][a-z0-9_-]{0,127}$")
            .map_err(|e| StorageError::InvalidDatasetId { dataset_id: e.to_string() })?;

        Ok(Self {
            config,
            keys,
            cipher: CipherEngine::new(),
            dataset_id_regex,
            metrics: None,
        })
    }

    /// Record seal/unseal timings into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Directory holding the sealed files
    pub fn sealed_dir(&self) -> &Path {
        &self.config.sealed_dir
    }

    /// Key provider backing this store
    pub fn key_provider(&self) -> &Arc<KeyProvider> {
        &self.keys
    }

    /// Lowercase and validate a dataset id
    pub fn normalize_dataset_id(&self, dataset_id: &str) -> StorageResult<String> {
        let normalized = dataset_id.trim().to_lowercase();
        if self.dataset_id_regex.is_match(&normalized) {
            Ok(normalized)
        } else {
            Err(StorageError::InvalidDatasetId { dataset_id: dataset_id.to_string() })
        }
    }

    /// Path of the sealed file for a dataset
    pub fn sealed_path(&self, dataset_id: &str) -> StorageResult<PathBuf> {
        let dataset_id = self.normalize_dataset_id(dataset_id)?;
        Ok(self.config.sealed_dir.join(format!("{}.{}", dataset_id, self.config.extension)))
    }

    /// Whether a sealed file exists for the dataset
    pub fn contains(&self, dataset_id: &str) -> bool {
        self.sealed_path(dataset_id)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Seal `plaintext` and atomically replace the dataset's sealed file
    pub fn store(&self, dataset_id: &str, plaintext: &[u8]) -> StorageResult<PathBuf> {
        let dataset_id = self.normalize_dataset_id(dataset_id)?;
        let path = self.sealed_path(&dataset_id)?;
        let key = self.keys.resolve_key()?;
        let started = Instant::now();

        let sealed = self.cipher.seal(&key, &dataset_id, plaintext)?;
        let bytes = sealed.encode();

        self.write_atomically(&path, &dataset_id, &bytes)?;

        if let Some(metrics) = &self.metrics {
            metrics.record_seal(started.elapsed());
        }

        tracing::info!(
            dataset = %dataset_id,
            key_id = %sealed.header.key_id,
            bytes = bytes.len(),
            "Sealed dataset"
        );
        Ok(path)
    }

    fn write_atomically(&self, path: &Path, dataset_id: &str, bytes: &[u8]) -> StorageResult<()> {
        let write_failed = |reason: String| StorageError::WriteFailed {
            path: path.to_string_lossy().to_string(),
            reason,
        };

        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", dataset_id))
            .suffix(".tmp")
            .tempfile_in(&self.config.sealed_dir)
            .map_err(|e| write_failed(e.to_string()))?;

        temp.write_all(bytes).map_err(|e| write_failed(e.to_string()))?;
        temp.as_file().sync_all().map_err(|e| write_failed(e.to_string()))?;
        temp.persist(path).map_err(|e| write_failed(e.error.to_string()))?;

        // Directory fsync is not available everywhere; the rename is what
        // carries atomicity.
        if let Ok(dir) = File::open(&self.config.sealed_dir) {
            let _ = dir.sync_all();
        }

        Ok(())
    }

    /// Read and parse a sealed file without decrypting it
    pub fn read_sealed(&self, dataset_id: &str) -> StorageResult<SealedRecord> {
        let dataset_id = self.normalize_dataset_id(dataset_id)?;
        let path = self.sealed_path(&dataset_id)?;

        if !path.is_file() {
            return Err(StorageError::DatasetNotFound { dataset_id });
        }

        let bytes = fs::read(&path)
            .map_err(|e| StorageError::ReadFailed {
                path: path.to_string_lossy().to_string(),
                reason: e.to_string(),
            })?;

        let sealed = SealedRecord::decode(&bytes)?;

        if sealed.dataset_id() != dataset_id {
            tracing::warn!(
                dataset = %dataset_id,
                sealed_for = %sealed.dataset_id(),
                "Sealed file is bound to a different dataset"
            );
            return Err(StorageError::Cipher(CipherError::AuthenticationFailed));
        }

        Ok(sealed)
    }

    /// Unseal a dataset into memory
    pub fn load(&self, dataset_id: &str) -> StorageResult<UnsealedBuffer> {
        let started = Instant::now();
        let sealed = self.read_sealed(dataset_id)?;
        let key = self.keys.resolve_key()?;

        let unsealed = self.cipher.unseal(&key, &sealed);
        if let Some(metrics) = &self.metrics {
            metrics.record_unseal(started.elapsed());
        }

        match unsealed {
            Ok(buffer) => {
                tracing::debug!(dataset = %sealed.dataset_id(), bytes = buffer.len(), "Unsealed dataset");
                Ok(buffer)
            }
            Err(e) => {
                tracing::warn!(dataset = %sealed.dataset_id(), "Unseal failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Sealed dataset ids, sorted. Temp files and foreign files are skipped.
    pub fn list_datasets(&self) -> StorageResult<Vec<String>> {
        let entries = fs::read_dir(&self.config.sealed_dir)
            .map_err(|e| StorageError::ReadFailed {
                path: self.config.sealed_dir.to_string_lossy().to_string(),
                reason: e.to_string(),
            })?;

        let mut datasets: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .map(|ext| ext.to_string_lossy() == self.config.extension.as_str())
                    .unwrap_or(false)
            })
            .filter_map(|path| path.file_stem().map(|stem| stem.to_string_lossy().to_string()))
            .filter(|stem| self.dataset_id_regex.is_match(stem))
            .collect();

        datasets.sort();
        Ok(datasets)
    }

    /// Delete a dataset's sealed file; returns whether one existed
    pub fn remove(&self, dataset_id: &str) -> StorageResult<bool> {
        let path = self.sealed_path(dataset_id)?;
        if !path.is_file() {
            return Ok(false);
        }

        fs::remove_file(&path)
            .map_err(|e| StorageError::WriteFailed {
                path: path.to_string_lossy().to_string(),
                reason: e.to_string(),
            })?;
        Ok(true)
    }

    /// Seal every `*.<extension>` file of `source_dir`, dataset id taken
    /// from the lowercased file stem. Failures are collected, not fatal.
    pub fn ingest_directory(&self, source_dir: &Path, extension: &str) -> StorageResult<IngestReport> {
        let entries = fs::read_dir(source_dir)
            .map_err(|_| StorageError::SourceUnreadable { path: source_dir.to_string_lossy().to_string() })?;

        let mut sources: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
                    .unwrap_or(false)
            })
            .collect();
        sources.sort();

        if sources.is_empty() {
            tracing::warn!("No .{} files found in {}", extension, source_dir.display());
        } else {
            tracing::info!("Sealing {} source files from {}", sources.len(), source_dir.display());
        }

        let mut report = IngestReport::default();
        for source in sources {
            match self.ingest_file(&source) {
                Ok((dataset_id, path)) => report.sealed.push((dataset_id, path)),
                Err(e) => {
                    tracing::error!("Failed to seal {}: {}", source.display(), e);
                    report.failed.push(IngestFailure { source, reason: e.to_string() });
                }
            }
        }

        tracing::info!("Sealed {} datasets, {} failures", report.sealed.len(), report.failed.len());
        Ok(report)
    }

    /// Seal one source file under the dataset id derived from its stem
    pub fn ingest_file(&self, source: &Path) -> StorageResult<(String, PathBuf)> {
        let stem = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let dataset_id = self.normalize_dataset_id(&stem)?;

        let plaintext = fs::read(source)
            .map(Zeroizing::new)
            .map_err(|_| StorageError::SourceUnreadable { path: source.to_string_lossy().to_string() })?;

        let path = self.store(&dataset_id, &plaintext)?;
        Ok((dataset_id, path))
    }
}
