//! Lenient JAR manifest parsing.
//!
//! Only the main section is consumed: it ends at the first blank line, and
//! lines starting with a single space continue the previous value per the
//! manifest wrapping convention. Unknown keys are ignored and malformed
//! input yields absent attributes rather than an error.

use std::sync::Arc;

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKey {
    SpecTitle,
    SpecVersion,
    SpecVendor,
    ImplTitle,
    ImplVersion,
    ImplVendor,
}

impl AttributeKey {
    pub const ALL: [AttributeKey; 6] = [
        AttributeKey::SpecTitle,
        AttributeKey::SpecVersion,
        AttributeKey::SpecVendor,
        AttributeKey::ImplTitle,
        AttributeKey::ImplVersion,
        AttributeKey::ImplVendor,
    ];

    pub fn manifest_name(self) -> &'static str {
        match self {
            AttributeKey::SpecTitle => "Specification-Title",
            AttributeKey::SpecVersion => "Specification-Version",
            AttributeKey::SpecVendor => "Specification-Vendor",
            AttributeKey::ImplTitle => "Implementation-Title",
            AttributeKey::ImplVersion => "Implementation-Version",
            AttributeKey::ImplVendor => "Implementation-Vendor",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManifestAttributes {
    spec_title: Option<String>,
    spec_version: Option<String>,
    spec_vendor: Option<String>,
    impl_title: Option<String>,
    impl_version: Option<String>,
    impl_vendor: Option<String>,
    class_path: Option<String>,
    multi_release: bool,
}

impl ManifestAttributes {
    pub fn parse(bytes: &[u8]) -> Arc<ManifestAttributes> {
        let text = String::from_utf8_lossy(bytes);
        let mut attributes = ManifestAttributes::default();

        for (name, value) in main_section_entries(&text) {
            match name.as_str() {
                "Specification-Title" => attributes.spec_title = Some(value),
                "Specification-Version" => attributes.spec_version = Some(value),
                "Specification-Vendor" => attributes.spec_vendor = Some(value),
                "Implementation-Title" => attributes.impl_title = Some(value),
                "Implementation-Version" => attributes.impl_version = Some(value),
                "Implementation-Vendor" => attributes.impl_vendor = Some(value),
                "Class-Path" => attributes.class_path = Some(value),
                "Multi-Release" => attributes.multi_release = value.trim().eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        Arc::new(attributes)
    }

    pub fn get(&self, key: AttributeKey) -> Option<&str> {
        let value = match key {
            AttributeKey::SpecTitle => &self.spec_title,
            AttributeKey::SpecVersion => &self.spec_version,
            AttributeKey::SpecVendor => &self.spec_vendor,
            AttributeKey::ImplTitle => &self.impl_title,
            AttributeKey::ImplVersion => &self.impl_version,
            AttributeKey::ImplVendor => &self.impl_vendor,
        };
        value.as_deref()
    }

    pub fn is_multi_release(&self) -> bool {
        self.multi_release
    }

    /// `Class-Path` references, split on whitespace per the manifest spec.
    pub fn class_path_entries(&self) -> Vec<&str> {
        self.class_path
            .as_deref()
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }
}

fn main_section_entries(text: &str) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = Vec::new();

    for raw_line in text.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.is_empty() {
            break;
        }

        if let Some(continuation) = line.strip_prefix(' ') {
            if let Some((_, value)) = entries.last_mut() {
                value.push_str(continuation);
            }
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            // Malformed line, skip it and keep what parses.
            continue;
        };
        entries.push((name.trim().to_string(), value.trim_start().to_string()));
    }

    entries
}
