//! I/O utilities.
//!
//! This module is responsible for reading JSON and TOML configuration files,
//! finding input files on disk, and writing CSV output to either a file or
//! standard output.

use std::fs;

use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _},
};

use crate::prelude::*;

/// Read TOML or JSON from a file. Files ending in `.json` are JSON, and
/// everything else is TOML.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let ext = path.extension().unwrap_or_default();
    if ext == "json" {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create directory: {:?}", parent)
                })?;
            }
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// A CSV writer that flushes after every record, so that a partially
/// completed run still leaves usable output behind.
pub struct CsvOutput {
    wtr: csv_async::AsyncWriter<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>>,
}

impl CsvOutput {
    /// Create a new CSV output and write its header row.
    pub async fn create<I, S>(path: Option<&Path>, headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let wtr = csv_async::AsyncWriterBuilder::new()
            .has_headers(false)
            .create_writer(create_writer(path).await?);
        let mut output = Self { wtr };
        output.write_record(headers).await?;
        Ok(output)
    }

    /// Write a single record and flush it.
    pub async fn write_record<I, S>(&mut self, record: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.wtr
            .write_record(record)
            .await
            .context("Failed to write CSV record")?;
        self.wtr.flush().await.context("Failed to flush CSV output")?;
        Ok(())
    }

    /// Finish writing and make sure everything reached the underlying file.
    pub async fn finish(self) -> Result<()> {
        let mut inner = self
            .wtr
            .into_inner()
            .await
            .map_err(|err| anyhow!("Failed to finish CSV output: {}", err))?;
        inner.flush().await.context("Failed to flush output")?;
        Ok(())
    }
}

/// Recursively find files under `dir` whose extension matches one of
/// `extensions` (compared case-insensitively). Results are sorted by path.
pub fn find_files_with_extensions(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(anyhow!("{:?} is not a directory", dir.display()));
    }
    let mut found = vec![];
    let mut pending = vec![dir.to_owned()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory {:?}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read entry in directory {:?}", dir.display())
            })?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to stat {:?}", path.display()))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if has_extension(&path, extensions) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Does `path` end in one of `extensions`?
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy();
            extensions.iter().any(|e| ext.eq_ignore_ascii_case(e))
        })
        .unwrap_or(false)
}
