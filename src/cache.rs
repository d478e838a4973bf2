//! Shared classpath index.
//!
//! `LoaderData` is the cacheable summary of one root: the set of package
//! hashes it provides (split by class vs. plain resource) and a Bloom
//! filter over short entry names. `ClasspathCache` merges every realized
//! loader's data into two package-hash buckets so a lookup can reject or
//! route without touching a loader. Buckets only ever grow during a
//! session; a full reset is the only removal.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::bloom::{BloomFilter, fingerprint};
use crate::loader::Loader;

const NAME_FILTER_FALSE_POSITIVE_RATE: f64 = 0.005;

pub const CLASS_EXTENSION: &str = ".class";

pub fn is_class_path(path: &str) -> bool {
    path.ends_with(CLASS_EXTENSION)
}

/// Hash of the path's directory portion, the cache bucket key.
pub fn package_hash(path: &str) -> u64 {
    let package = match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    };
    fnv1a64(package)
}

pub fn short_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

fn fnv1a64(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Immutable once built; never mutated after a loader is indexed.
#[derive(Debug, Clone)]
pub struct LoaderData {
    resource_packages: HashSet<u64>,
    class_packages: HashSet<u64>,
    names: BloomFilter,
}

impl LoaderData {
    pub fn empty() -> Self {
        LoaderDataBuilder::default().build()
    }

    pub fn contains_name(&self, short_name: &str) -> bool {
        self.names.contains(short_name)
    }

    pub fn contains_package(&self, path: &str) -> bool {
        let hash = package_hash(path);
        if is_class_path(path) {
            self.class_packages.contains(&hash)
        } else {
            self.resource_packages.contains(&hash)
        }
    }

    pub fn class_packages(&self) -> impl Iterator<Item = u64> + '_ {
        self.class_packages.iter().copied()
    }

    pub fn resource_packages(&self) -> impl Iterator<Item = u64> + '_ {
        self.resource_packages.iter().copied()
    }
}

#[derive(Debug, Default)]
pub struct LoaderDataBuilder {
    resource_packages: HashSet<u64>,
    class_packages: HashSet<u64>,
    name_fingerprints: HashSet<u64>,
}

impl LoaderDataBuilder {
    pub fn add_path(&mut self, relative_path: &str) {
        let hash = package_hash(relative_path);
        if is_class_path(relative_path) {
            self.class_packages.insert(hash);
        } else {
            self.resource_packages.insert(hash);
        }
        self.name_fingerprints
            .insert(fingerprint(short_name(relative_path)));
    }

    pub fn build(self) -> LoaderData {
        let mut names = BloomFilter::with_capacity(
            self.name_fingerprints.len(),
            NAME_FILTER_FALSE_POSITIVE_RATE,
        );
        for fp in &self.name_fingerprints {
            names.insert_fingerprint(*fp);
        }

        LoaderData {
            resource_packages: self.resource_packages,
            class_packages: self.class_packages,
            names,
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    class_map: HashMap<u64, Vec<Arc<Loader>>>,
    resource_map: HashMap<u64, Vec<Arc<Loader>>>,
}

#[derive(Debug, Default)]
pub struct ClasspathCache {
    state: RwLock<CacheState>,
}

impl ClasspathCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one realized loader's data into the shared buckets. Bucket
    /// entries stay sorted by loader index so candidate iteration
    /// preserves root order even when loaders are indexed out of order.
    pub fn merge(&self, data: &LoaderData, loader: &Arc<Loader>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        for hash in data.class_packages() {
            insert_ordered(state.class_map.entry(hash).or_default(), loader);
        }
        for hash in data.resource_packages() {
            insert_ordered(state.resource_map.entry(hash).or_default(), loader);
        }
    }

    /// Loaders whose indexed packages could contain `path`, in root order.
    pub fn candidates(&self, path: &str) -> Vec<Arc<Loader>> {
        let hash = package_hash(path);
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let map = if is_class_path(path) {
            &state.class_map
        } else {
            &state.resource_map
        };
        map.get(&hash).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.class_map.clear();
        state.resource_map.clear();
    }

    pub fn stats(&self) -> CacheIndexStats {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        CacheIndexStats {
            class_packages: state.class_map.len() as u64,
            resource_packages: state.resource_map.len() as u64,
        }
    }
}

fn insert_ordered(bucket: &mut Vec<Arc<Loader>>, loader: &Arc<Loader>) {
    if bucket.iter().any(|l| l.index() == loader.index()) {
        return;
    }
    let position = bucket
        .iter()
        .position(|l| l.index() > loader.index())
        .unwrap_or(bucket.len());
    bucket.insert(position, Arc::clone(loader));
}

#[derive(Debug, Serialize)]
pub struct CacheIndexStats {
    pub class_packages: u64,
    pub resource_packages: u64,
}
