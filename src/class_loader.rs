//! Class-loading façade.
//!
//! Exposes the two operations an embedding runtime needs on top of a
//! `ClassPath`: class byte resolution (with package metadata derived once
//! per package from the owning root's manifest attributes) and generic
//! resource resolution, singular or multi-valued. A per-name lock table
//! guarantees at most one concurrent resolution per class name; once a
//! class is resolved its bytes are kept, so the underlying fetch runs
//! exactly once per name.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::class_path::{ClassPath, ResourceUrls};
use crate::locks::ClassLoadingLocks;
use crate::manifest::{AttributeKey, ManifestAttributes};
use crate::resource::{Resource, SecurityInfo};

pub fn class_name_to_entry_path(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}

/// Package metadata from the owning root's manifest main attributes.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub name: String,
    pub spec_title: Option<String>,
    pub spec_version: Option<String>,
    pub spec_vendor: Option<String>,
    pub impl_title: Option<String>,
    pub impl_version: Option<String>,
    pub impl_vendor: Option<String>,
}

impl PackageInfo {
    fn derive(name: &str, attributes: Option<&ManifestAttributes>) -> PackageInfo {
        let get = |key| {
            attributes
                .and_then(|a| a.get(key))
                .map(str::to_string)
        };
        PackageInfo {
            name: name.to_string(),
            spec_title: get(AttributeKey::SpecTitle),
            spec_version: get(AttributeKey::SpecVersion),
            spec_vendor: get(AttributeKey::SpecVendor),
            impl_title: get(AttributeKey::ImplTitle),
            impl_version: get(AttributeKey::ImplVersion),
            impl_vendor: get(AttributeKey::ImplVendor),
        }
    }
}

#[derive(Debug)]
pub struct LoadedClass {
    pub name: String,
    pub bytes: Vec<u8>,
    pub source_url: Url,
    pub package: Option<Arc<PackageInfo>>,
    pub security: Option<Arc<SecurityInfo>>,
}

pub struct UrlClassLoader {
    class_path: Arc<ClassPath>,
    locks: ClassLoadingLocks,
    packages: Mutex<HashMap<String, Arc<PackageInfo>>>,
    loaded: Mutex<HashMap<String, Arc<LoadedClass>>>,
}

impl UrlClassLoader {
    pub fn new(class_path: Arc<ClassPath>) -> UrlClassLoader {
        UrlClassLoader {
            class_path,
            locks: ClassLoadingLocks::new(),
            packages: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn class_path(&self) -> &Arc<ClassPath> {
        &self.class_path
    }

    /// Resolve a class's byte content by its dotted name. Errors only on
    /// a failed read of a present class; absence is `Ok(None)`.
    pub fn load_class_bytes(&self, class_name: &str) -> Result<Option<Arc<LoadedClass>>> {
        if let Some(hit) = self.lookup_loaded(class_name) {
            return Ok(Some(hit));
        }

        let lock = self.locks.lock_for(class_name);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = self.lookup_loaded(class_name) {
            return Ok(Some(hit));
        }

        let entry_path = class_name_to_entry_path(class_name);
        let Some(resource) = self.class_path.get_resource(&entry_path) else {
            return Ok(None);
        };
        let bytes = resource.bytes()?;

        let loaded = Arc::new(LoadedClass {
            name: class_name.to_string(),
            bytes,
            source_url: resource.url().clone(),
            package: self.package_for(class_name, resource.attributes()),
            security: resource.security_info(),
        });
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(class_name.to_string(), Arc::clone(&loaded));
        Ok(Some(loaded))
    }

    pub fn get_resource(&self, name: &str) -> Option<Resource> {
        self.class_path.get_resource(name)
    }

    pub fn get_resource_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.class_path.get_resource(name)?.try_bytes()
    }

    pub fn get_resources(&self, name: &str) -> ResourceUrls {
        self.class_path.get_resources(name)
    }

    fn lookup_loaded(&self, class_name: &str) -> Option<Arc<LoadedClass>> {
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(class_name)
            .cloned()
    }

    fn package_for(
        &self,
        class_name: &str,
        attributes: Option<&ManifestAttributes>,
    ) -> Option<Arc<PackageInfo>> {
        let (package_name, _) = class_name.rsplit_once('.')?;
        let mut packages = self.packages.lock().unwrap_or_else(|e| e.into_inner());
        let info = packages
            .entry(package_name.to_string())
            .or_insert_with(|| Arc::new(PackageInfo::derive(package_name, attributes)));
        Some(Arc::clone(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_path::ClassPathConfig;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};
    use zip::write::FileOptions;

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

    fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            zip.start_file(*name, options)?;
            zip.write_all(content)?;
        }
        zip.finish()?;
        Ok(())
    }

    fn loader_over_jar(jar: &Path) -> UrlClassLoader {
        let class_path = Arc::new(ClassPath::new(
            vec![Url::from_file_path(jar).unwrap().to_string()],
            ClassPathConfig::default(),
        ));
        UrlClassLoader::new(class_path)
    }

    #[test]
    fn class_name_maps_to_entry_path() {
        assert_eq!(
            class_name_to_entry_path("org.example.Main"),
            "org/example/Main.class"
        );
        assert_eq!(class_name_to_entry_path("TopLevel"), "TopLevel.class");
    }

    #[test]
    fn loads_class_bytes_with_package_metadata() -> Result<()> {
        let jar = temp_path("facade_load.jar");
        write_jar(
            &jar,
            &[
                (
                    "META-INF/MANIFEST.MF",
                    b"Implementation-Title: demo\nImplementation-Version: 3.0\n\n" as &[u8],
                ),
                ("org/example/Main.class", b"\xca\xfe\xba\xbemain"),
            ],
        )?;

        let loader = loader_over_jar(&jar);
        let loaded = loader.load_class_bytes("org.example.Main")?.unwrap();
        assert_eq!(loaded.bytes, b"\xca\xfe\xba\xbemain");
        let package = loaded.package.as_ref().unwrap();
        assert_eq!(package.name, "org.example");
        assert_eq!(package.impl_title.as_deref(), Some("demo"));
        assert_eq!(package.impl_version.as_deref(), Some("3.0"));

        assert!(loader.load_class_bytes("org.example.Missing")?.is_none());

        std::fs::remove_file(jar)?;
        Ok(())
    }

    #[test]
    fn package_metadata_is_derived_once_per_package() -> Result<()> {
        let jar = temp_path("facade_package.jar");
        write_jar(
            &jar,
            &[
                ("META-INF/MANIFEST.MF", b"Implementation-Title: demo\n\n" as &[u8]),
                ("org/example/A.class", b"a"),
                ("org/example/B.class", b"b"),
            ],
        )?;

        let loader = loader_over_jar(&jar);
        let a = loader.load_class_bytes("org.example.A")?.unwrap();
        let b = loader.load_class_bytes("org.example.B")?.unwrap();
        assert!(Arc::ptr_eq(
            a.package.as_ref().unwrap(),
            b.package.as_ref().unwrap()
        ));

        std::fs::remove_file(jar)?;
        Ok(())
    }

    #[test]
    fn default_package_has_no_package_info() -> Result<()> {
        let jar = temp_path("facade_default_pkg.jar");
        write_jar(&jar, &[("Top.class", b"t")])?;

        let loader = loader_over_jar(&jar);
        let loaded = loader.load_class_bytes("Top")?.unwrap();
        assert!(loaded.package.is_none());

        std::fs::remove_file(jar)?;
        Ok(())
    }

    #[test]
    fn repeated_loads_reuse_the_first_fetch() -> Result<()> {
        let jar = temp_path("facade_memo.jar");
        write_jar(&jar, &[("org/example/A.class", b"a")])?;

        let loader = loader_over_jar(&jar);
        let first = loader.load_class_bytes("org.example.A")?.unwrap();
        let second = loader.load_class_bytes("org.example.A")?.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        std::fs::remove_file(jar)?;
        Ok(())
    }

    #[test]
    fn resource_accessors_delegate_to_class_path() -> Result<()> {
        let jar = temp_path("facade_resources.jar");
        write_jar(&jar, &[("config/app.properties", b"k=v")])?;

        let loader = loader_over_jar(&jar);
        assert_eq!(
            loader.get_resource_bytes("config/app.properties").as_deref(),
            Some(&b"k=v"[..])
        );
        assert!(loader.get_resource("config/app.properties").is_some());
        let urls: Vec<Url> = loader.get_resources("config/app.properties").collect();
        assert_eq!(urls.len(), 1);

        std::fs::remove_file(jar)?;
        Ok(())
    }
}
