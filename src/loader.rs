//! The per-root loader contract.
//!
//! One `Loader` serves resources from a single realized root. The variants
//! are a tagged union rather than a trait hierarchy: directory roots,
//! archive roots (with an optional security extension), and the empty
//! stand-in that keeps an unreadable root's index slot so search order is
//! preserved. A loader starts unindexed; once its `LoaderData` is built
//! (or applied from a cache pool) it never changes.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use url::Url;

use crate::archive::ArchiveLoader;
use crate::cache::{LoaderData, short_name};
use crate::directory::DirectoryLoader;
use crate::resource::Resource;

#[derive(Debug)]
pub enum LoaderKind {
    Directory(DirectoryLoader),
    Archive(ArchiveLoader),
    Empty,
}

#[derive(Debug)]
pub struct Loader {
    index: usize,
    url: Url,
    kind: LoaderKind,
    data: OnceLock<Arc<LoaderData>>,
    merged: AtomicBool,
}

impl Loader {
    pub(crate) fn new(index: usize, url: Url, kind: LoaderKind) -> Self {
        Self {
            index,
            url,
            kind,
            data: OnceLock::new(),
            merged: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn kind(&self) -> &LoaderKind {
        &self.kind
    }

    pub fn as_archive(&self) -> Option<&ArchiveLoader> {
        match &self.kind {
            LoaderKind::Archive(archive) => Some(archive),
            _ => None,
        }
    }

    /// Cheap topological hint; `true` while the loader is unindexed.
    pub fn contains_path(&self, path: &str) -> bool {
        match self.data.get() {
            Some(data) => data.contains_package(path),
            None => !matches!(self.kind, LoaderKind::Empty),
        }
    }

    /// Bloom-filter check: may false-positive, never false-negative.
    pub fn contains_name(&self, full_name: &str, short: &str) -> bool {
        match self.data.get() {
            Some(data) => data.contains_package(full_name) && data.contains_name(short),
            None => !matches!(self.kind, LoaderKind::Empty),
        }
    }

    pub fn get_resource(&self, path: &str) -> Option<Resource> {
        match &self.kind {
            LoaderKind::Directory(dir) => dir.get_resource(path),
            LoaderKind::Archive(archive) => archive.get_resource(path),
            LoaderKind::Empty => None,
        }
    }

    pub fn build_data(&self) -> Result<LoaderData> {
        match &self.kind {
            LoaderKind::Directory(dir) => dir.build_data(),
            LoaderKind::Archive(archive) => archive.build_data(),
            LoaderKind::Empty => Ok(LoaderData::empty()),
        }
    }

    pub fn data(&self) -> Option<&Arc<LoaderData>> {
        self.data.get()
    }

    /// Apply externally cached data. Returns false if the loader was
    /// already indexed.
    pub(crate) fn prime_data(&self, data: Arc<LoaderData>) -> bool {
        self.data.set(data).is_ok()
    }

    /// Index the loader, building its data on first call. A build failure
    /// degrades to an empty index so the root just stops matching.
    pub(crate) fn ensure_data(&self) -> Arc<LoaderData> {
        self.data
            .get_or_init(|| match self.build_data() {
                Ok(data) => Arc::new(data),
                Err(err) => {
                    tracing::warn!(url = %self.url, error = %err, "failed to index root");
                    Arc::new(LoaderData::empty())
                }
            })
            .clone()
    }

    /// Claim the one-time merge into the shared cache. True exactly once.
    pub(crate) fn mark_merged(&self) -> bool {
        !self.merged.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_merged(&self) -> bool {
        self.merged.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if let LoaderKind::Archive(archive) = &self.kind {
            archive.close();
        }
    }
}

/// Convenience used by lookup paths: both checks against one loader.
pub fn loader_accepts(loader: &Loader, path: &str) -> bool {
    loader.contains_path(path) && loader.contains_name(path, short_name(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_loader_rejects_and_serves_nothing() {
        let url = Url::parse("file:///missing/root.jar").unwrap();
        let loader = Loader::new(3, url, LoaderKind::Empty);

        assert_eq!(loader.index(), 3);
        assert!(!loader.contains_path("org/example/A.class"));
        assert!(!loader.contains_name("org/example/A.class", "A.class"));
        assert!(loader.get_resource("org/example/A.class").is_none());
        assert!(loader.build_data().is_ok());
    }

    #[test]
    fn prime_data_wins_only_once() {
        let url = Url::parse("file:///missing/root.jar").unwrap();
        let loader = Loader::new(0, url, LoaderKind::Empty);

        assert!(loader.prime_data(Arc::new(LoaderData::empty())));
        assert!(!loader.prime_data(Arc::new(LoaderData::empty())));
        assert!(loader.data().is_some());
    }
}
