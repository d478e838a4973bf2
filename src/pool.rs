//! Cross-instance cache pool.
//!
//! Multiple `ClassPath` instances sharing roots reuse the expensive
//! per-root work: built `LoaderData` and parsed manifest attributes,
//! keyed by root URL. Append-only; whether a given root may be cached at
//! all is the caller's call, via the predicate supplied at `ClassPath`
//! construction.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cache::LoaderData;
use crate::manifest::ManifestAttributes;

#[derive(Debug, Default)]
pub struct CachePool {
    loader_data: RwLock<HashMap<String, Arc<LoaderData>>>,
    manifests: RwLock<HashMap<String, Option<Arc<ManifestAttributes>>>>,
}

impl CachePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loader_data(&self, root_url: &str) -> Option<Arc<LoaderData>> {
        self.loader_data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(root_url)
            .cloned()
    }

    pub fn store_loader_data(&self, root_url: &str, data: Arc<LoaderData>) {
        self.loader_data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(root_url.to_string())
            .or_insert(data);
    }

    /// `Some(None)` means "known to have no manifest", distinct from a
    /// root that was never seen.
    pub fn manifest(&self, root_url: &str) -> Option<Option<Arc<ManifestAttributes>>> {
        self.manifests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(root_url)
            .cloned()
    }

    pub fn store_manifest(&self, root_url: &str, attributes: Option<Arc<ManifestAttributes>>) {
        self.manifests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(root_url.to_string())
            .or_insert(attributes);
    }

    pub fn cached_roots(&self) -> usize {
        self.loader_data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::AttributeKey;

    #[test]
    fn loader_data_first_store_wins() {
        let pool = CachePool::new();
        let url = "file:///tmp/a.jar";
        assert!(pool.loader_data(url).is_none());

        let first = Arc::new(LoaderData::empty());
        pool.store_loader_data(url, Arc::clone(&first));
        pool.store_loader_data(url, Arc::new(LoaderData::empty()));
        assert!(Arc::ptr_eq(&pool.loader_data(url).unwrap(), &first));
        assert_eq!(pool.cached_roots(), 1);
    }

    #[test]
    fn manifest_absence_is_remembered() {
        let pool = CachePool::new();
        let url = "file:///tmp/b.jar";
        assert!(pool.manifest(url).is_none());

        pool.store_manifest(url, None);
        assert!(matches!(pool.manifest(url), Some(None)));

        let attrs = ManifestAttributes::parse(b"Implementation-Title: demo\n");
        pool.store_manifest("file:///tmp/c.jar", Some(attrs));
        let fetched = pool.manifest("file:///tmp/c.jar").unwrap().unwrap();
        assert_eq!(fetched.get(AttributeKey::ImplTitle), Some("demo"));
    }
}
