//! Streaming CSV export of candidate rows to local staging files.

use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    error::ExportError,
    policy::{ExportFormat, RetentionPolicy},
    registry::{CandidateSet, TableSpec},
};
use crate::db::RowKey;

/// A staging file that is removed when dropped unless retained.
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
    retained: bool,
}

impl StagingFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            retained: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file on disk after this guard is dropped.
    pub fn retain(&mut self) {
        self.retained = true;
    }

    /// Remove the file now.
    pub async fn remove(mut self) {
        self.retained = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed staging file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove staging file"),
        }
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.retained {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove staging file");
        }
    }
}

/// A table's candidates written to a local file.
#[derive(Debug)]
pub struct ExportArtifact {
    pub table: String,
    pub staging: StagingFile,
    pub row_count: u64,
    /// SHA-256 of the file bytes, hex encoded.
    pub checksum: String,
    pub size_bytes: u64,
    pub format: ExportFormat,
    pub columns: Vec<String>,
    /// Greatest key written. Purges never go past it.
    pub last_key: Option<RowKey>,
}

impl ExportArtifact {
    pub fn local_path(&self) -> &Path {
        self.staging.path()
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            local_path: Some(self.local_path().to_string_lossy().to_string()),
            remote_location: None,
            checksum: self.checksum.clone(),
            row_count: self.row_count,
            size_bytes: self.size_bytes,
        }
    }
}

/// Reported view of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_location: Option<String>,
    pub checksum: String,
    pub row_count: u64,
    pub size_bytes: u64,
}

/// Writes candidate sets to `{output_dir}/{table}_{run_timestamp}_{run_id}.csv`.
///
/// The run id keeps runs that start in the same second from sharing a
/// staging file.
pub struct Exporter {
    output_dir: PathBuf,
    run_id: Uuid,
    write_buffer_bytes: usize,
}

impl Exporter {
    pub fn new(output_dir: impl Into<PathBuf>, run_id: Uuid, write_buffer_bytes: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            run_id,
            write_buffer_bytes: write_buffer_bytes.max(1024),
        }
    }

    pub fn staging_path(&self, table: &str, policy: &RetentionPolicy) -> PathBuf {
        self.output_dir.join(format!(
            "{table}_{}_{}.{}",
            policy.run_timestamp(),
            self.run_id.simple(),
            policy.export_format().extension()
        ))
    }

    /// Stream `candidates` into a staging file.
    ///
    /// Rows are encoded into an in-memory buffer that is written out and
    /// hashed whenever it passes `write_buffer_bytes`. SQL NULL is written
    /// as an empty field. On error the partial file is removed.
    pub async fn export(
        &self,
        table: &TableSpec,
        candidates: &CandidateSet,
        policy: &RetentionPolicy,
    ) -> Result<ExportArtifact, ExportError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let staging = StagingFile::new(self.staging_path(&table.name, policy));
        let mut file = tokio::fs::File::create(staging.path()).await?;

        let mut sink = ChunkSink::default();
        let mut builder = csv::WriterBuilder::new();
        builder.has_headers(false);
        let mut writer = builder.from_writer(Vec::with_capacity(self.write_buffer_bytes));
        writer.write_record(candidates.columns())?;

        let mut rows = candidates.stream();
        let mut row_count: u64 = 0;
        let mut last_key: Option<RowKey> = None;

        while let Some(row) = rows.try_next().await? {
            writer.write_record(row.values.iter().map(|v| v.as_deref().unwrap_or("")))?;
            row_count += 1;
            last_key = Some(row.key);

            if writer.get_ref().len() >= self.write_buffer_bytes {
                let buffer = sink.drain(&mut file, writer).await?;
                writer = builder.from_writer(buffer);
            }
        }

        sink.drain(&mut file, writer).await?;
        file.flush().await?;
        file.sync_all().await?;

        let checksum = hex::encode(sink.hasher.finalize());
        info!(
            table = %table.name,
            rows = row_count,
            size = sink.bytes,
            path = %staging.path().display(),
            "Exported candidates"
        );

        Ok(ExportArtifact {
            table: table.name.clone(),
            staging,
            row_count,
            checksum,
            size_bytes: sink.bytes,
            format: policy.export_format(),
            columns: candidates.columns().to_vec(),
            last_key,
        })
    }
}

#[derive(Default)]
struct ChunkSink {
    hasher: Sha256,
    bytes: u64,
}

impl ChunkSink {
    /// Flush `writer`, then write and hash everything it buffered.
    ///
    /// Hands back the emptied buffer so the next writer can reuse it.
    async fn drain(
        &mut self,
        file: &mut tokio::fs::File,
        writer: csv::Writer<Vec<u8>>,
    ) -> std::io::Result<Vec<u8>> {
        let mut buffer = writer.into_inner().map_err(|e| e.into_error())?;
        if !buffer.is_empty() {
            file.write_all(&buffer).await?;
            self.hasher.update(&buffer);
            self.bytes += buffer.len() as u64;
            buffer.clear();
        }
        Ok(buffer)
    }
}
