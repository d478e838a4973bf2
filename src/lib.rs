//! # classpath
//!
//! A classpath resource loading engine: an ordered list of roots
//! (directories and zip/jar archives) resolved to byte content, built for
//! heavy reuse across millions of lookups.
//!
//! ## Architecture
//!
//! - **bloom**: Bloom filter over name fingerprints for negative-lookup rejection
//! - **manifest**: lenient JAR manifest main-attributes parsing
//! - **resource**: immutable resolved resources with deferred or eager content
//! - **cache**: per-root loader data and the shared package-hash index
//! - **loader**: the per-root loader contract (directory / archive / empty)
//! - **directory**: directory roots with walk-or-persisted-listing indexing
//! - **archive**: zip/jar roots with LRU handle caching and multi-release remap
//! - **pool**: cross-instance reuse of loader data and manifest attributes
//! - **class_path**: ordered lazy realization and lookup orchestration
//! - **locks**: weakly retained per-name load locks
//! - **class_loader**: class-byte and resource resolution façade

pub mod archive;
pub mod bloom;
pub mod cache;
pub mod class_loader;
pub mod class_path;
pub mod directory;
pub mod loader;
pub mod locks;
pub mod manifest;
pub mod pool;
pub mod resource;
