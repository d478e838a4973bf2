//! Archive (zip/jar) roots.
//!
//! An open archive is an mmap of the file plus its parsed central
//! directory, shared behind a bounded LRU handle cache: eviction under
//! capacity pressure approximates soft-reference reclaim, and any access
//! that finds its handle gone transparently reopens the archive. A cache
//! capacity of zero reopens per call (handle locking disabled).
//!
//! The loader also owns the archive-level lazy state: manifest main
//! attributes, the multi-release remap table, optional preloaded entry
//! bytes, and the security-info source for secure roots.

use anyhow::{Context, Result};
use memmap2::Mmap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use url::Url;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::cache::{LoaderData, LoaderDataBuilder};
use crate::class_path::ClassPathStats;
use crate::manifest::{MANIFEST_PATH, ManifestAttributes};
use crate::resource::{Resource, ResourceContent, SecuritySource};

pub const MULTI_RELEASE_PREFIX: &str = "META-INF/versions/";

const SIGNATURE_EXTENSIONS: [&str; 4] = [".SF", ".RSA", ".DSA", ".EC"];

// Cursor wants AsRef<[u8]>; keep the mmap behind a newtype that provides it.
struct MmapReader(Mmap);

impl AsRef<[u8]> for MmapReader {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

pub struct OpenArchive {
    names: HashSet<String>,
    zip: Mutex<ZipArchive<Cursor<MmapReader>>>,
}

impl fmt::Debug for OpenArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenArchive")
            .field("entries", &self.names.len())
            .finish()
    }
}

impl OpenArchive {
    pub fn open(path: &Path, stats: &ClassPathStats) -> Result<OpenArchive> {
        stats.record_io_open();
        let file =
            File::open(path).with_context(|| format!("无法打开 jar: {}", path.display()))?;
        // SAFETY: The file is opened read-only and remains valid for the lifetime of the mmap.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mmap 失败: {}", path.display()))?;
        let archive = ZipArchive::new(Cursor::new(MmapReader(mmap)))
            .with_context(|| format!("无法读取 zip 结构: {}", path.display()))?;

        let names = archive.file_names().map(str::to_string).collect();
        Ok(OpenArchive {
            names,
            zip: Mutex::new(archive),
        })
    }

    pub fn names(&self) -> &HashSet<String> {
        &self.names
    }

    pub fn read(&self, entry_name: &str) -> Result<Option<Vec<u8>>> {
        if !self.names.contains(entry_name) {
            return Ok(None);
        }

        let mut zip = self.zip.lock().unwrap_or_else(|e| e.into_inner());
        let mut entry = match zip.by_name(entry_name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to open entry: {entry_name}"));
            }
        };

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read entry: {entry_name}"))?;
        Ok(Some(bytes))
    }

    fn read_all(&self) -> Result<HashMap<String, Arc<[u8]>>> {
        let mut zip = self.zip.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = HashMap::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .with_context(|| format!("Failed to read entry: {name}"))?;
            entries.insert(name, Arc::from(bytes));
        }
        Ok(entries)
    }
}

#[derive(Debug)]
struct CachedHandle {
    archive: Arc<OpenArchive>,
    last_used: u64,
}

/// Bounded LRU of open archive handles, shared by every archive loader of
/// one `ClassPath`.
#[derive(Debug)]
pub struct HandleCache {
    capacity: usize,
    clock: AtomicU64,
    entries: Mutex<HashMap<PathBuf, CachedHandle>>,
    stats: ClassPathStats,
}

impl HandleCache {
    pub fn new(capacity: usize, stats: ClassPathStats) -> Self {
        Self {
            capacity,
            clock: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
            stats,
        }
    }

    pub fn with_archive(&self, path: &Path) -> Result<Arc<OpenArchive>> {
        if self.capacity == 0 {
            return Ok(Arc::new(OpenArchive::open(path, &self.stats)?));
        }

        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = entries.get_mut(path) {
            cached.last_used = stamp;
            return Ok(Arc::clone(&cached.archive));
        }

        let archive = Arc::new(OpenArchive::open(path, &self.stats)?);
        entries.insert(
            path.to_path_buf(),
            CachedHandle {
                archive: Arc::clone(&archive),
                last_used: stamp,
            },
        );

        if entries.len() > self.capacity
            && let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, h)| h.last_used)
                .map(|(p, _)| p.clone())
        {
            entries.remove(&oldest);
            self.stats.record_handle_eviction();
        }

        Ok(archive)
    }

    pub fn remove(&self, path: &Path) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(path);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct ArchiveLoader {
    path: PathBuf,
    base_url: Url,
    handles: Arc<HandleCache>,
    platform_version: u32,
    preloaded: Option<HashMap<String, Arc<[u8]>>>,
    manifest: OnceLock<Option<Arc<ManifestAttributes>>>,
    remap: OnceLock<HashMap<String, String>>,
    security: Option<Arc<SecuritySource>>,
    access_count: AtomicU64,
    stats: ClassPathStats,
}

impl ArchiveLoader {
    pub(crate) fn new(
        path: PathBuf,
        base_url: Url,
        handles: Arc<HandleCache>,
        platform_version: u32,
        preload_contents: bool,
        secure: bool,
        stats: ClassPathStats,
    ) -> Result<ArchiveLoader> {
        // Open once up front: validates the root and primes the handle cache.
        let archive = handles.with_archive(&path)?;

        let security = secure.then(|| {
            let mut signature_entries: Vec<String> = archive
                .names()
                .iter()
                .filter(|n| {
                    n.starts_with("META-INF/")
                        && SIGNATURE_EXTENSIONS.iter().any(|ext| n.ends_with(ext))
                })
                .cloned()
                .collect();
            signature_entries.sort();
            Arc::new(SecuritySource::new(
                base_url.clone(),
                path.clone(),
                signature_entries,
            ))
        });

        let preloaded = if preload_contents {
            Some(archive.read_all()?)
        } else {
            None
        };

        Ok(ArchiveLoader {
            path,
            base_url,
            handles,
            platform_version,
            preloaded,
            manifest: OnceLock::new(),
            remap: OnceLock::new(),
            security,
            access_count: AtomicU64::new(0),
            stats,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn get_resource(&self, path: &str) -> Option<Resource> {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        let entry = self.resolve_entry_name(path);

        let content = if let Some(preloaded) = &self.preloaded {
            ResourceContent::Bytes(Arc::clone(preloaded.get(entry.as_ref())?))
        } else {
            let archive = match self.handles.with_archive(&self.path) {
                Ok(archive) => archive,
                Err(err) => {
                    tracing::warn!(archive = %self.path.display(), error = %err, "archive became unreadable");
                    return None;
                }
            };
            if !archive.names().contains(entry.as_ref()) {
                return None;
            }
            ResourceContent::Entry {
                handles: Arc::clone(&self.handles),
                archive: self.path.clone(),
                entry: entry.to_string(),
            }
        };

        let url = Url::parse(&format!("jar:{}!/{entry}", self.base_url))
            .unwrap_or_else(|_| self.base_url.clone());
        Some(
            Resource::new(url, content)
                .with_attributes(self.manifest())
                .with_security(self.security.clone()),
        )
    }

    pub fn build_data(&self) -> Result<LoaderData> {
        let mut builder = LoaderDataBuilder::default();
        let add_names = |builder: &mut LoaderDataBuilder, names: &mut dyn Iterator<Item = &str>| {
            for name in names {
                if name.ends_with('/') {
                    continue;
                }
                builder.add_path(name);
                if let Some(base) = self.applicable_overlay(name) {
                    builder.add_path(base);
                }
            }
        };

        if let Some(preloaded) = &self.preloaded {
            add_names(&mut builder, &mut preloaded.keys().map(String::as_str));
        } else {
            let archive = self.handles.with_archive(&self.path)?;
            add_names(&mut builder, &mut archive.names().iter().map(String::as_str));
        }
        Ok(builder.build())
    }

    /// Manifest main attributes, parsed once. Absent or malformed
    /// manifests yield `None` / empty attributes, never an error.
    pub fn manifest(&self) -> Option<Arc<ManifestAttributes>> {
        self.manifest
            .get_or_init(|| match self.entry_bytes(MANIFEST_PATH) {
                Ok(Some(bytes)) => Some(ManifestAttributes::parse(&bytes)),
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!(archive = %self.path.display(), error = %err, "failed to read manifest");
                    None
                }
            })
            .clone()
    }

    /// Apply manifest attributes fetched from a cache pool. Loses to an
    /// already-computed value.
    pub(crate) fn prime_manifest(&self, attributes: Option<Arc<ManifestAttributes>>) {
        let _ = self.manifest.set(attributes);
    }

    pub fn close(&self) {
        self.handles.remove(&self.path);
    }

    fn entry_bytes(&self, entry_name: &str) -> Result<Option<Vec<u8>>> {
        if let Some(preloaded) = &self.preloaded {
            return Ok(preloaded.get(entry_name).map(|b| b.to_vec()));
        }
        self.handles.with_archive(&self.path)?.read(entry_name)
    }

    /// The actual entry to serve for `path`: the highest applicable
    /// multi-release overlay when the jar is flagged multi-release,
    /// otherwise the path itself.
    fn resolve_entry_name<'a>(&self, path: &'a str) -> std::borrow::Cow<'a, str> {
        let multi_release = self
            .manifest()
            .is_some_and(|attrs| attrs.is_multi_release());
        if !multi_release {
            return path.into();
        }

        match self.version_remap().get(path) {
            Some(overlay) => overlay.clone().into(),
            None => path.into(),
        }
    }

    fn version_remap(&self) -> &HashMap<String, String> {
        self.remap.get_or_init(|| {
            let names: Vec<String> = if let Some(preloaded) = &self.preloaded {
                preloaded.keys().cloned().collect()
            } else {
                match self.handles.with_archive(&self.path) {
                    Ok(archive) => archive.names().iter().cloned().collect(),
                    Err(err) => {
                        tracing::warn!(archive = %self.path.display(), error = %err, "archive became unreadable");
                        return HashMap::new();
                    }
                }
            };

            let mut best: HashMap<String, (u32, String)> = HashMap::new();
            for name in names {
                let Some(rest) = name.strip_prefix(MULTI_RELEASE_PREFIX) else {
                    continue;
                };
                let Some((version_str, base)) = rest.split_once('/') else {
                    continue;
                };
                let version = match version_str.parse::<u32>() {
                    Ok(v) => v,
                    Err(_) => {
                        tracing::warn!(
                            archive = %self.path.display(),
                            entry = %name,
                            "skipping overlay with malformed version segment"
                        );
                        continue;
                    }
                };
                if version > self.platform_version || base.is_empty() || base.ends_with('/') {
                    continue;
                }

                match best.get(base) {
                    Some((existing, _)) if *existing >= version => {}
                    _ => {
                        best.insert(base.to_string(), (version, name.clone()));
                    }
                }
            }

            best.into_iter()
                .map(|(base, (_, overlay))| (base, overlay))
                .collect()
        })
    }

    /// For an overlay entry applicable on this platform, the base path it
    /// shadows; used so indexing covers overlay-only entries.
    fn applicable_overlay<'a>(&self, name: &'a str) -> Option<&'a str> {
        let rest = name.strip_prefix(MULTI_RELEASE_PREFIX)?;
        let (version_str, base) = rest.split_once('/')?;
        let version = version_str.parse::<u32>().ok()?;
        (version <= self.platform_version && !base.is_empty() && !base.ends_with('/'))
            .then_some(base)
    }
}
