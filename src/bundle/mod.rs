//! Application bundles
//!
//! A bundle is the unit the supervisor serves: a manifest plus a tree of
//! files (application assets under `assets/`). The serving core only talks
//! to the [`PackageStore`] trait; [`DirStore`] backs it with a plain
//! directory and [`MemStore`] keeps everything in memory for tests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::error::{GulError, Result};

/// Serving options carried by the manifest (or supplied by the embedder)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServeOptions {
    /// Virtual-host patterns the app answers for; empty means "any host".
    /// Segments are dot-separated, `:name` segments capture into params.
    #[serde(default)]
    pub vhost: Vec<String>,
    /// Value for the `Server` response header
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Bundle manifest (`manifest.json` at the bundle root)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: HashMap<String, String>,
    #[serde(default)]
    pub serve: ServeOptions,
}

/// Summary of a started application, reported by the worker during the
/// init handshake and retained by the supervisor until `stop`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    /// One line per registered route, e.g. `[GET] /hello/:name`
    pub routes: Vec<String>,
    pub dependencies: HashMap<String, String>,
}

/// Read-only access to a bundle's files
pub trait PackageStore: Send + Sync {
    /// Fetch a file by bundle-relative name (e.g. `assets/index.html`)
    fn get_file(&self, name: &str) -> Option<Vec<u8>>;

    /// Whether a file exists without reading it
    fn exists(&self, name: &str) -> bool;

    /// Modification time of the bundle as a whole
    fn modified(&self) -> SystemTime;

    /// The bundle manifest
    fn manifest(&self) -> Manifest;
}

/// Bundle backed by a directory on disk
#[derive(Debug)]
pub struct DirStore {
    root: PathBuf,
    manifest: Manifest,
    modified: SystemTime,
}

impl DirStore {
    /// Open a bundle directory, reading `manifest.json` from its root
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let manifest_path = root.join("manifest.json");
        let raw = fs::read(&manifest_path).map_err(|e| {
            GulError::Bundle(format!("{}: {}", manifest_path.display(), e))
        })?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| GulError::Bundle(format!("invalid manifest: {}", e)))?;
        let modified = fs::metadata(&root)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(Self {
            root,
            manifest,
            modified,
        })
    }

    /// Bundle root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    // Reject names that climb out of the bundle root.
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let rel = Path::new(name.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(rel))
    }
}

impl PackageStore for DirStore {
    fn get_file(&self, name: &str) -> Option<Vec<u8>> {
        let path = self.resolve(name)?;
        fs::read(path).ok()
    }

    fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn modified(&self) -> SystemTime {
        self.modified
    }

    fn manifest(&self) -> Manifest {
        self.manifest.clone()
    }
}

/// In-memory bundle for tests and embedding
pub struct MemStore {
    files: HashMap<String, Vec<u8>>,
    manifest: Manifest,
    modified: SystemTime,
}

impl MemStore {
    pub fn new(name: &str) -> Self {
        Self {
            files: HashMap::new(),
            manifest: Manifest {
                name: name.to_string(),
                version: "0.0.0".to_string(),
                ..Manifest::default()
            },
            modified: SystemTime::now(),
        }
    }

    pub fn with_file(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.to_string(), data.into());
        self
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = modified;
        self
    }
}

impl PackageStore for MemStore {
    fn get_file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.get(name.trim_start_matches('/')).cloned()
    }

    fn exists(&self, name: &str) -> bool {
        self.files.contains_key(name.trim_start_matches('/'))
    }

    fn modified(&self) -> SystemTime {
        self.modified
    }

    fn manifest(&self) -> Manifest {
        self.manifest.clone()
    }
}
