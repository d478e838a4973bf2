//! Directory roots.
//!
//! Files are served straight from the filesystem. The index is built by a
//! recursive parallel walk; a persisted path listing at the root
//! (`.classpath-index.json`) replaces the walk on repeated runs over
//! unchanged output directories, and can be (re)written with
//! `persist_index`.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use url::Url;

use crate::cache::{LoaderData, LoaderDataBuilder};
use crate::class_path::ClassPathStats;
use crate::resource::{Resource, ResourceContent};

pub const DIRECTORY_INDEX_FILE: &str = ".classpath-index.json";

#[derive(Debug, Serialize, Deserialize)]
struct DirectoryIndex {
    files: Vec<String>,
}

#[derive(Debug)]
pub struct DirectoryLoader {
    root: PathBuf,
    base_url: Url,
    stats: ClassPathStats,
}

impl DirectoryLoader {
    pub(crate) fn new(root: PathBuf, base_url: Url, stats: ClassPathStats) -> Self {
        Self {
            root,
            base_url,
            stats,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get_resource(&self, path: &str) -> Option<Resource> {
        if path.is_empty() || path.split('/').any(|segment| segment == "..") {
            return None;
        }

        let full = self.root.join(path);
        self.stats.record_io_open();
        let metadata = std::fs::metadata(&full).ok()?;
        if !metadata.is_file() {
            return None;
        }

        let url = self.base_url.join(path).ok()?;
        Some(Resource::new(url, ResourceContent::File(full)))
    }

    pub fn build_data(&self) -> Result<LoaderData> {
        let mut builder = LoaderDataBuilder::default();
        for path in self.relative_paths()? {
            builder.add_path(&path);
        }
        Ok(builder.build())
    }

    /// Relative paths of every file under the root, from the persisted
    /// listing when one is present, otherwise from a recursive walk.
    pub fn relative_paths(&self) -> Result<Vec<String>> {
        if let Some(files) = self.load_persisted_index() {
            return Ok(files);
        }
        self.walk()
    }

    /// Write the current walk result next to the root so later runs can
    /// skip the walk. Published atomically: tmp file, then rename.
    pub fn persist_index(&self) -> Result<()> {
        let files = self.walk()?;
        let index_path = self.root.join(DIRECTORY_INDEX_FILE);
        let payload = serde_json::to_string(&DirectoryIndex { files })?;

        let mut tmp_os = index_path.as_os_str().to_os_string();
        tmp_os.push(".tmp");
        let tmp = PathBuf::from(tmp_os);
        std::fs::write(&tmp, payload)
            .with_context(|| format!("Failed to write index file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &index_path).with_context(|| {
            format!("Failed to atomically replace index file: {}", index_path.display())
        })?;
        Ok(())
    }

    fn load_persisted_index(&self) -> Option<Vec<String>> {
        let index_path = self.root.join(DIRECTORY_INDEX_FILE);
        if !index_path.exists() {
            return None;
        }

        self.stats.record_io_open();
        let raw = std::fs::read_to_string(&index_path).ok()?;
        match serde_json::from_str::<DirectoryIndex>(&raw) {
            Ok(index) => {
                tracing::debug!(
                    root = %self.root.display(),
                    files = index.files.len(),
                    "loaded persisted directory index"
                );
                Some(index.files)
            }
            Err(err) => {
                tracing::warn!(
                    root = %self.root.display(),
                    error = %err,
                    "ignoring malformed persisted directory index"
                );
                None
            }
        }
    }

    fn walk(&self) -> Result<Vec<String>> {
        self.stats.record_io_open();
        let (tx, rx) = mpsc::channel();

        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .build_parallel();

        walker.run(|| {
            let tx = tx.clone();
            Box::new(move |entry| {
                if let Ok(entry) = entry
                    && entry.file_type().is_some_and(|t| t.is_file())
                {
                    let _ = tx.send(entry.into_path());
                }
                ignore::WalkState::Continue
            })
        });

        drop(tx);
        let mut files: Vec<String> = rx
            .iter()
            .filter_map(|path| {
                let relative = path.strip_prefix(&self.root).ok()?;
                let name = relative.to_string_lossy().replace('\\', "/");
                (name != DIRECTORY_INDEX_FILE).then_some(name)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}
