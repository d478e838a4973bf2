//! Classpath orchestration.
//!
//! A `ClassPath` owns the ordered pending-root queue and drives every
//! lookup: cache first, then loaders in ascending index order, realizing
//! the next pending root on demand. Realization is serialized; each root
//! becomes a loader exactly once, duplicates are skipped, and an
//! aggregate classpath jar has its `Class-Path` manifest references
//! appended to the queue. Once the queue drains the instance is fully
//! processed and a cache miss is a true global absence, answered with no
//! further I/O.

use anyhow::{Context, Result, anyhow};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use url::Url;

use crate::archive::{ArchiveLoader, HandleCache};
use crate::cache::ClasspathCache;
use crate::directory::DirectoryLoader;
use crate::loader::{Loader, LoaderKind, loader_accepts};
use crate::pool::CachePool;
use crate::resource::Resource;

pub const DEFAULT_LAZY_INDEXING_THRESHOLD: u64 = 1000;
pub const DEFAULT_PLATFORM_VERSION: u32 = 21;
pub const DEFAULT_HANDLE_CACHE_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct ClassPathConfig {
    /// Reuse archive handles across calls; disabled, every access reopens.
    pub allow_lock: bool,
    /// Build and query the package-hash + Bloom-filter index.
    pub use_cache: bool,
    /// Honor an external full-path index instead of per-request scanning.
    pub enable_jar_index: bool,
    /// Eagerly read archive entries into memory at realization.
    pub preload_contents: bool,
    /// Defer per-archive indexing until the access-count threshold.
    pub lazy_classloading_caches: bool,
    pub lazy_indexing_threshold: u64,
    /// Tolerate non-URI-escaped root specs (bare filesystem paths).
    pub accept_unescaped_urls: bool,
    /// Escalate missing/unreadable roots from warn to error.
    pub log_error_on_missing_jar: bool,
    /// Feature version gating `META-INF/versions/<N>` overlays.
    pub platform_version: u32,
    pub handle_cache_capacity: usize,
}

impl Default for ClassPathConfig {
    fn default() -> Self {
        Self {
            allow_lock: true,
            use_cache: true,
            enable_jar_index: false,
            preload_contents: false,
            lazy_classloading_caches: false,
            lazy_indexing_threshold: DEFAULT_LAZY_INDEXING_THRESHOLD,
            accept_unescaped_urls: false,
            log_error_on_missing_jar: false,
            platform_version: DEFAULT_PLATFORM_VERSION,
            handle_cache_capacity: DEFAULT_HANDLE_CACHE_CAPACITY,
        }
    }
}

/// Decides per root whether the shared pool may cache it (e.g. exclude
/// roots still being written to).
pub type CachePredicate = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

#[derive(Default)]
pub struct ClassPathOptions {
    pub pool: Option<Arc<CachePool>>,
    pub pool_predicate: Option<CachePredicate>,
    /// Complete `{root spec → known relative paths}` map, consulted only
    /// with `enable_jar_index`.
    pub external_index: Option<HashMap<String, HashSet<String>>>,
    /// Root specs whose resources must carry security info.
    pub secure_roots: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClassPathStats {
    io_opens: Arc<AtomicU64>,
    handle_evictions: Arc<AtomicU64>,
    cache_hits: Arc<AtomicU64>,
    cache_misses: Arc<AtomicU64>,
    realized_loaders: Arc<AtomicUsize>,
}

impl ClassPathStats {
    pub(crate) fn record_io_open(&self) {
        self.io_opens.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handle_eviction(&self) {
        self.handle_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_realized(&self) {
        self.realized_loaders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn io_opens(&self) -> u64 {
        self.io_opens.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, fully_processed: bool) -> StatsSnapshot {
        StatsSnapshot {
            realized_loaders: self.realized_loaders.load(Ordering::Relaxed),
            io_opens: self.io_opens.load(Ordering::Relaxed),
            handle_evictions: self.handle_evictions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            fully_processed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub realized_loaders: usize,
    pub io_opens: u64,
    pub handle_evictions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fully_processed: bool,
}

#[derive(Debug)]
struct PendingRoots {
    queue: VecDeque<String>,
    registered: HashSet<String>,
}

pub struct ClassPath {
    config: ClassPathConfig,
    pool: Option<Arc<CachePool>>,
    pool_predicate: Option<CachePredicate>,
    /// Keyed by resolved root URL.
    external_index: Option<HashMap<String, HashSet<String>>>,
    initial_roots: Vec<String>,
    secure_roots: HashSet<String>,
    handles: Arc<HandleCache>,
    cache: ClasspathCache,
    stats: ClassPathStats,
    pending: Mutex<PendingRoots>,
    loaders: RwLock<Vec<Arc<Loader>>>,
    merged_loaders: AtomicUsize,
    all_processed: AtomicBool,
    closed: AtomicBool,
}

impl ClassPath {
    pub fn new(roots: Vec<String>, config: ClassPathConfig) -> ClassPath {
        Self::with_options(roots, config, ClassPathOptions::default())
    }

    pub fn with_options(
        roots: Vec<String>,
        config: ClassPathConfig,
        options: ClassPathOptions,
    ) -> ClassPath {
        let stats = ClassPathStats::default();
        let capacity = if config.allow_lock {
            config.handle_cache_capacity
        } else {
            0
        };
        let handles = Arc::new(HandleCache::new(capacity, stats.clone()));

        let resolve = |spec: &str| {
            resolve_root_url(spec, config.accept_unescaped_urls)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| spec.to_string())
        };
        let initial_roots: Vec<String> = roots.iter().map(|r| resolve(r)).collect();
        let external_index = options.external_index.map(|index| {
            index.into_iter().map(|(k, v)| (resolve(&k), v)).collect()
        });
        let secure_roots = options.secure_roots.iter().map(|r| resolve(r)).collect();

        let all_processed = roots.is_empty();
        ClassPath {
            config,
            pool: options.pool,
            pool_predicate: options.pool_predicate,
            external_index,
            initial_roots,
            secure_roots,
            handles,
            cache: ClasspathCache::new(),
            stats,
            pending: Mutex::new(PendingRoots {
                queue: roots.into(),
                registered: HashSet::new(),
            }),
            loaders: RwLock::new(Vec::new()),
            merged_loaders: AtomicUsize::new(0),
            all_processed: AtomicBool::new(all_processed),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClassPathConfig {
        &self.config
    }

    pub fn is_fully_processed(&self) -> bool {
        self.all_processed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.is_fully_processed())
    }

    pub fn cache_stats(&self) -> crate::cache::CacheIndexStats {
        self.cache.stats()
    }

    /// Resolve `path` to the first root that provides it, in root order.
    pub fn get_resource(&self, path: &str) -> Option<Resource> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let path = normalize_path(path);
        if path.is_empty() {
            return None;
        }

        if self.config.enable_jar_index
            && let Some(index) = &self.external_index
        {
            return self.get_resource_via_external_index(path, index);
        }

        if self.config.use_cache && !self.config.lazy_classloading_caches {
            for loader in self.cache.candidates(path) {
                if loader_accepts(&loader, path)
                    && let Some(resource) = loader.get_resource(path)
                {
                    self.stats.record_cache_hit();
                    return Some(resource);
                }
            }
            self.stats.record_cache_miss();
            if self.cache_complete() {
                return None;
            }
        }

        let mut index = 0usize;
        while let Some(loader) = self.loader_at(index) {
            index += 1;
            if !loader_accepts(&loader, path) {
                continue;
            }
            let found = loader.get_resource(path);
            self.maybe_index_lazily(&loader);
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// URLs of `path` in every root that provides it: a lazy, finite,
    /// non-restartable sequence in root order with one match per root.
    pub fn get_resources(&self, path: &str) -> ResourceUrls {
        if self.closed.load(Ordering::Acquire) {
            return ResourceUrls::empty();
        }
        let path = normalize_path(path).to_string();
        if path.is_empty() {
            return ResourceUrls::empty();
        }

        let loaders: Vec<Arc<Loader>> = if self.config.enable_jar_index
            && let Some(index) = &self.external_index
        {
            self.initial_roots
                .iter()
                .filter(|root| index.get(*root).is_some_and(|set| set.contains(&path)))
                .filter_map(|root| self.loader_for_url(root))
                .collect()
        } else if self.config.use_cache
            && !self.config.lazy_classloading_caches
            && self.cache_complete()
        {
            self.cache.candidates(&path)
        } else {
            self.realize_all();
            self.loaders.read().unwrap_or_else(|e| e.into_inner()).clone()
        };

        ResourceUrls {
            loaders: loaders.into_iter(),
            path,
        }
    }

    /// Drain the pending queue and index every loader, building loader
    /// data in parallel where it is not built yet.
    pub fn preload(&self) {
        self.realize_all();
        if !self.config.use_cache {
            return;
        }
        let loaders = self.loaders.read().unwrap_or_else(|e| e.into_inner()).clone();
        loaders.par_iter().for_each(|loader| self.index_loader(loader));
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let loaders = self.loaders.read().unwrap_or_else(|e| e.into_inner()).clone();
        for loader in loaders {
            loader.close();
        }
        self.handles.clear();
        self.cache.clear();
    }

    fn cache_complete(&self) -> bool {
        self.is_fully_processed()
            && self.merged_loaders.load(Ordering::Acquire)
                == self.loaders.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn loader_at(&self, index: usize) -> Option<Arc<Loader>> {
        loop {
            {
                let loaders = self.loaders.read().unwrap_or_else(|e| e.into_inner());
                if index < loaders.len() {
                    return Some(Arc::clone(&loaders[index]));
                }
            }
            self.realize_next()?;
        }
    }

    fn loader_for_url(&self, url: &str) -> Option<Arc<Loader>> {
        loop {
            {
                let loaders = self.loaders.read().unwrap_or_else(|e| e.into_inner());
                if let Some(loader) = loaders.iter().find(|l| l.url().as_str() == url) {
                    return Some(Arc::clone(loader));
                }
            }
            self.realize_next()?;
        }
    }

    fn realize_all(&self) {
        while self.realize_next().is_some() {}
    }

    /// Convert the next pending root into a loader. Serialized by the
    /// pending mutex; duplicate URLs are skipped, first occurrence wins.
    fn realize_next(&self) -> Option<Arc<Loader>> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let Some(spec) = pending.queue.pop_front() else {
                self.all_processed.store(true, Ordering::Release);
                return None;
            };

            let url = match resolve_root_url(&spec, self.config.accept_unescaped_urls) {
                Ok(url) => url,
                Err(err) => {
                    self.log_bad_root(&spec, &err);
                    continue;
                }
            };
            if !pending.registered.insert(url.to_string()) {
                tracing::debug!(url = %url, "root already registered, skipping");
                continue;
            }

            let index = self.loaders.read().unwrap_or_else(|e| e.into_inner()).len();
            let loader = Arc::new(self.create_loader(index, url));
            self.chain_classpath_attribute(&loader, &mut pending.queue);

            self.loaders
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(Arc::clone(&loader));
            self.stats.record_realized();
            tracing::debug!(url = %loader.url(), index, "realized root");

            if self.config.use_cache
                && !(self.config.lazy_classloading_caches && loader.as_archive().is_some())
            {
                self.index_loader(&loader);
            }

            if pending.queue.is_empty() {
                self.all_processed.store(true, Ordering::Release);
            }
            return Some(loader);
        }
    }

    fn create_loader(&self, index: usize, url: Url) -> Loader {
        let Ok(path) = url.to_file_path() else {
            self.log_bad_root(url.as_str(), &anyhow!("unsupported root scheme"));
            return Loader::new(index, url, LoaderKind::Empty);
        };

        let kind = match std::fs::metadata(&path) {
            Err(err) => {
                self.log_bad_root(url.as_str(), &anyhow!(err).context("root missing or unreadable"));
                LoaderKind::Empty
            }
            Ok(metadata) if metadata.is_dir() => {
                let base_url = Url::from_directory_path(&path).unwrap_or_else(|()| url.clone());
                LoaderKind::Directory(DirectoryLoader::new(path, base_url, self.stats.clone()))
            }
            Ok(_) => {
                let secure = self.secure_roots.contains(url.as_str());
                match ArchiveLoader::new(
                    path,
                    url.clone(),
                    Arc::clone(&self.handles),
                    self.config.platform_version,
                    self.config.preload_contents,
                    secure,
                    self.stats.clone(),
                ) {
                    Ok(archive) => {
                        self.prime_manifest_from_pool(&url, &archive);
                        LoaderKind::Archive(archive)
                    }
                    Err(err) => {
                        self.log_bad_root(url.as_str(), &err);
                        LoaderKind::Empty
                    }
                }
            }
        };

        Loader::new(index, url, kind)
    }

    /// Expand an aggregate classpath jar's `Class-Path` references onto
    /// the pending queue; depth is bounded only by the manifest chain.
    fn chain_classpath_attribute(&self, loader: &Arc<Loader>, queue: &mut VecDeque<String>) {
        let Some(archive) = loader.as_archive() else {
            return;
        };
        if !is_aggregate_classpath_jar(archive.path()) {
            return;
        }
        let Some(manifest) = archive.manifest() else {
            return;
        };

        for entry in manifest.class_path_entries() {
            match loader.url().join(entry) {
                Ok(referenced) => {
                    tracing::debug!(from = %loader.url(), to = %referenced, "appending Class-Path root");
                    queue.push_back(referenced.to_string());
                }
                Err(err) => {
                    tracing::warn!(from = %loader.url(), entry, error = %err, "unresolvable Class-Path entry");
                }
            }
        }
    }

    /// Index one loader and merge its data into the shared cache, going
    /// through the pool when the root is cacheable. An empty stand-in is
    /// never pooled: the root may exist for another instance.
    fn index_loader(&self, loader: &Arc<Loader>) {
        if loader.data().is_none() {
            let poolable = !matches!(loader.kind(), LoaderKind::Empty);
            let key = loader.url().as_str();
            let pooled = poolable
                .then(|| self.cacheable_pool(loader.url()))
                .flatten()
                .and_then(|pool| pool.loader_data(key));
            match pooled {
                Some(data) => {
                    loader.prime_data(data);
                }
                None => {
                    let data = loader.ensure_data();
                    if poolable && let Some(pool) = self.cacheable_pool(loader.url()) {
                        pool.store_loader_data(key, data);
                    }
                }
            }
        }

        if let Some(data) = loader.data()
            && loader.mark_merged()
        {
            self.cache.merge(data, loader);
            self.merged_loaders.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn maybe_index_lazily(&self, loader: &Arc<Loader>) {
        if !self.config.use_cache || !self.config.lazy_classloading_caches {
            return;
        }
        if loader.data().is_some() && loader.is_merged() {
            return;
        }
        if let Some(archive) = loader.as_archive()
            && archive.access_count() >= self.config.lazy_indexing_threshold
        {
            self.index_loader(loader);
        }
    }

    fn get_resource_via_external_index(
        &self,
        path: &str,
        index: &HashMap<String, HashSet<String>>,
    ) -> Option<Resource> {
        for root in &self.initial_roots {
            if index.get(root).is_some_and(|set| set.contains(path))
                && let Some(loader) = self.loader_for_url(root)
                && let Some(resource) = loader.get_resource(path)
            {
                return Some(resource);
            }
        }
        // Absent from the index union: a guaranteed global absence.
        None
    }

    fn prime_manifest_from_pool(&self, url: &Url, archive: &ArchiveLoader) {
        let Some(pool) = self.cacheable_pool(url) else {
            return;
        };
        match pool.manifest(url.as_str()) {
            Some(attributes) => archive.prime_manifest(attributes),
            None => pool.store_manifest(url.as_str(), archive.manifest()),
        }
    }

    fn cacheable_pool(&self, url: &Url) -> Option<&Arc<CachePool>> {
        let pool = self.pool.as_ref()?;
        let cacheable = self.pool_predicate.as_ref().is_none_or(|p| p(url));
        cacheable.then_some(pool)
    }

    fn log_bad_root(&self, spec: &str, err: &anyhow::Error) {
        if self.config.log_error_on_missing_jar {
            tracing::error!(root = spec, error = %err, "classpath root unusable");
        } else {
            tracing::warn!(root = spec, error = %err, "classpath root unusable");
        }
    }
}

impl Drop for ClassPath {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.close();
        }
    }
}

pub struct ResourceUrls {
    loaders: std::vec::IntoIter<Arc<Loader>>,
    path: String,
}

impl ResourceUrls {
    fn empty() -> Self {
        Self {
            loaders: Vec::new().into_iter(),
            path: String::new(),
        }
    }
}

impl Iterator for ResourceUrls {
    type Item = Url;

    fn next(&mut self) -> Option<Url> {
        for loader in self.loaders.by_ref() {
            if loader_accepts(&loader, &self.path)
                && let Some(resource) = loader.get_resource(&self.path)
            {
                return Some(resource.url().clone());
            }
        }
        None
    }
}

fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

pub(crate) fn resolve_root_url(spec: &str, accept_unescaped: bool) -> Result<Url> {
    match Url::parse(spec) {
        // Windows drive letters parse as a one-letter scheme; treat them
        // as paths when unescaped specs are tolerated.
        Ok(url) if url.scheme().len() == 1 && accept_unescaped => path_to_url(spec),
        Ok(url) => Ok(url),
        Err(_) if accept_unescaped => path_to_url(spec),
        Err(err) => Err(err).with_context(|| format!("Failed to parse root URL: {spec}")),
    }
}

fn path_to_url(spec: &str) -> Result<Url> {
    let path = Path::new(spec);
    if !path.is_absolute() {
        return Err(anyhow!("root path is not absolute: {spec}"));
    }
    Url::from_file_path(path).map_err(|()| anyhow!("root is not a valid file path: {spec}"))
}

fn is_aggregate_classpath_jar(path: &Path) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let stem = stem.to_ascii_lowercase();
    stem == "classpath" || stem.ends_with(".classpath")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_documented_values() {
        let config = ClassPathConfig::default();
        assert!(config.allow_lock);
        assert!(config.use_cache);
        assert!(!config.lazy_classloading_caches);
        assert_eq!(config.lazy_indexing_threshold, 1000);
        assert_eq!(config.platform_version, DEFAULT_PLATFORM_VERSION);
    }

    #[test]
    fn resolve_root_url_accepts_file_urls_and_gated_paths() {
        assert!(resolve_root_url("file:///tmp/a.jar", false).is_ok());
        assert!(resolve_root_url("/tmp/a.jar", false).is_err());
        let resolved = resolve_root_url("/tmp/a.jar", true).unwrap();
        assert_eq!(resolved.as_str(), "file:///tmp/a.jar");
        assert!(resolve_root_url("relative/a.jar", true).is_err());
    }

    #[test]
    fn aggregate_classpath_jar_naming() {
        assert!(is_aggregate_classpath_jar(Path::new("/x/classpath.jar")));
        assert!(is_aggregate_classpath_jar(Path::new("/x/Classpath.JAR")));
        assert!(is_aggregate_classpath_jar(Path::new("/x/app.classpath.jar")));
        assert!(!is_aggregate_classpath_jar(Path::new("/x/library.jar")));
    }

    #[test]
    fn empty_root_list_is_fully_processed_and_absent() {
        let class_path = ClassPath::new(Vec::new(), ClassPathConfig::default());
        assert!(class_path.is_fully_processed());
        assert!(class_path.get_resource("org/example/A.class").is_none());
        assert_eq!(class_path.stats().realized_loaders, 0);
    }

    #[test]
    fn normalize_path_strips_leading_slash() {
        assert_eq!(normalize_path("/org/example/A.class"), "org/example/A.class");
        assert_eq!(normalize_path("org/example/A.class"), "org/example/A.class");
    }
}
