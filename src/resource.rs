//! Resolved resource values.
//!
//! A `Resource` is immutable once produced by a loader: a URL, a content
//! accessor, the owning archive's manifest main attributes, and optional
//! security info. Content is either materialized bytes (preload) or a
//! deferred fetch that re-reads through the owning root on access, so a
//! reclaimed archive handle is transparently reopened.

use anyhow::{Context, Result};
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use url::Url;

use crate::archive::HandleCache;
use crate::manifest::{AttributeKey, ManifestAttributes};

#[derive(Debug, Clone)]
pub enum ResourceContent {
    Bytes(Arc<[u8]>),
    File(PathBuf),
    Entry {
        handles: Arc<HandleCache>,
        archive: PathBuf,
        entry: String,
    },
}

#[derive(Debug, Clone)]
pub struct Resource {
    url: Url,
    content: ResourceContent,
    attributes: Option<Arc<ManifestAttributes>>,
    security: Option<Arc<SecuritySource>>,
}

impl Resource {
    pub(crate) fn new(url: Url, content: ResourceContent) -> Self {
        Self {
            url,
            content,
            attributes: None,
            security: None,
        }
    }

    pub(crate) fn with_attributes(mut self, attributes: Option<Arc<ManifestAttributes>>) -> Self {
        self.attributes = attributes;
        self
    }

    pub(crate) fn with_security(mut self, security: Option<Arc<SecuritySource>>) -> Self {
        self.security = security;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Eager byte content. A read failure is raised to the caller.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match &self.content {
            ResourceContent::Bytes(bytes) => Ok(bytes.to_vec()),
            ResourceContent::File(path) => std::fs::read(path)
                .with_context(|| format!("Failed to read resource file: {}", path.display())),
            ResourceContent::Entry {
                handles,
                archive,
                entry,
            } => handles
                .with_archive(archive)?
                .read(entry)?
                .with_context(|| format!("Entry vanished from archive {}: {entry}", archive.display())),
        }
    }

    /// Streamed-access analog: a read failure degrades to absence.
    pub fn try_bytes(&self) -> Option<Vec<u8>> {
        match self.bytes() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(url = %self.url, error = %err, "resource read failed");
                None
            }
        }
    }

    pub fn attribute(&self, key: AttributeKey) -> Option<&str> {
        self.attributes.as_deref().and_then(|a| a.get(key))
    }

    pub fn attributes(&self) -> Option<&ManifestAttributes> {
        self.attributes.as_deref()
    }

    pub fn security_info(&self) -> Option<Arc<SecurityInfo>> {
        self.security.as_deref().and_then(SecuritySource::info)
    }
}

/// Protection metadata attached to resources of a secure archive root.
/// Signature verification is out of scope; signer entries are carried
/// opaquely.
#[derive(Debug, Clone)]
pub struct SecurityInfo {
    pub code_source: Url,
    pub archive_sha256: String,
    pub signature_entries: Vec<String>,
}

#[derive(Debug)]
pub struct SecuritySource {
    code_source: Url,
    archive_path: PathBuf,
    signature_entries: Vec<String>,
    computed: OnceLock<Option<Arc<SecurityInfo>>>,
}

impl SecuritySource {
    pub(crate) fn new(code_source: Url, archive_path: PathBuf, signature_entries: Vec<String>) -> Self {
        Self {
            code_source,
            archive_path,
            signature_entries,
            computed: OnceLock::new(),
        }
    }

    pub fn info(&self) -> Option<Arc<SecurityInfo>> {
        self.computed
            .get_or_init(|| match self.compute() {
                Ok(info) => Some(Arc::new(info)),
                Err(err) => {
                    tracing::warn!(
                        archive = %self.archive_path.display(),
                        error = %err,
                        "failed to compute security info"
                    );
                    None
                }
            })
            .clone()
    }

    fn compute(&self) -> Result<SecurityInfo> {
        let file = File::open(&self.archive_path)
            .with_context(|| format!("无法打开 jar: {}", self.archive_path.display()))?;
        // SAFETY: The file is opened read-only and remains valid for the lifetime of the mmap.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mmap 失败: {}", self.archive_path.display()))?;

        let mut hasher = Sha256::new();
        hasher.update(&mmap[..]);
        let digest = hasher.finalize();

        Ok(SecurityInfo {
            code_source: self.code_source.clone(),
            archive_sha256: hex::encode(digest),
            signature_entries: self.signature_entries.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "classpath_test_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    #[test]
    fn file_resource_reads_bytes() -> Result<()> {
        let path = temp_path("resource_file.txt");
        std::fs::write(&path, b"payload")?;

        let url = Url::from_file_path(&path).unwrap();
        let resource = Resource::new(url, ResourceContent::File(path.clone()));
        assert_eq!(resource.bytes()?, b"payload");
        assert_eq!(resource.try_bytes().as_deref(), Some(&b"payload"[..]));

        std::fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn missing_file_raises_on_eager_path_but_not_streamed() {
        let path = temp_path("resource_missing.txt");
        let url = Url::from_file_path(&path).unwrap();
        let resource = Resource::new(url, ResourceContent::File(path));
        assert!(resource.bytes().is_err());
        assert!(resource.try_bytes().is_none());
    }

    #[test]
    fn security_source_computes_digest_once() -> Result<()> {
        let path = temp_path("resource_secure.jar");
        std::fs::write(&path, b"jar-bytes")?;

        let source = SecuritySource::new(
            Url::from_file_path(&path).unwrap(),
            path.clone(),
            vec!["META-INF/SIGNER.SF".to_string()],
        );
        let first = source.info().expect("digest computed");
        // Mutate the file; the cached info must not change.
        std::fs::write(&path, b"different")?;
        let second = source.info().expect("digest cached");
        assert_eq!(first.archive_sha256, second.archive_sha256);
        assert_eq!(first.signature_entries, vec!["META-INF/SIGNER.SF"]);

        std::fs::remove_file(path)?;
        Ok(())
    }
}
