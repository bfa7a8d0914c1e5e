//! Spec registries: sources the catalog is bootstrapped from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use walkdir::WalkDir;

use broker_core::Spec;
use broker_core::config::RegistryConfig;

use crate::error::RegistryError;

/// A named source of specs.
#[async_trait]
pub trait Registry: Send + Sync {
    fn name(&self) -> &str;

    /// Load every spec the registry offers, with the number of images it
    /// inspected. Images that do not yield a spec still count.
    async fn load_specs(&self) -> Result<(Vec<Spec>, usize), RegistryError>;

    /// Whether a load failure should abort the whole bootstrap.
    fn fail(&self, err: &RegistryError) -> bool;
}

/// Reads specs from `.json` and `.toml` files under a directory tree. Each
/// file is one image.
pub struct DirectoryRegistry {
    name: String,
    path: PathBuf,
    fail_on_error: bool,
}

impl DirectoryRegistry {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            fail_on_error: false,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            name: config.name.clone(),
            path: config.path.clone(),
            fail_on_error: config.fail_on_error,
        }
    }
}

fn is_spec_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("toml")
    )
}

/// Walk `root` and parse every spec file below it. Blocking.
fn scan_directory(name: &str, root: &Path) -> Result<(Vec<Spec>, usize), RegistryError> {
    if !root.is_dir() {
        return Err(RegistryError::MissingDirectory {
            name: name.to_string(),
            path: root.to_path_buf(),
        });
    }

    let mut specs = Vec::new();
    let mut images = 0;
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|source| RegistryError::Walk {
            name: name.to_string(),
            source,
        })?;
        if !entry.file_type().is_file() || !is_spec_file(entry.path()) {
            continue;
        }
        images += 1;
        if let Some(spec) = read_spec(name, entry.path())? {
            specs.push(spec);
        }
    }

    debug!(registry = %name, images, specs = specs.len(), "registry loaded");
    Ok((specs, images))
}

fn read_spec(name: &str, path: &Path) -> Result<Option<Spec>, RegistryError> {
    let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
        name: name.to_string(),
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str::<Spec>(&content).map_err(|e| e.to_string()),
        _ => serde_json::from_str::<Spec>(&content).map_err(|e| e.to_string()),
    };
    match parsed {
        Ok(spec) => Ok(Some(spec)),
        Err(e) => {
            warn!(registry = %name, path = %path.display(), error = %e, "skipping unreadable spec");
            Ok(None)
        }
    }
}

#[async_trait]
impl Registry for DirectoryRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_specs(&self) -> Result<(Vec<Spec>, usize), RegistryError> {
        let name = self.name.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || scan_directory(&name, &path))
            .await
            .map_err(|source| RegistryError::Task {
                name: self.name.clone(),
                source,
            })?
    }

    fn fail(&self, _err: &RegistryError) -> bool {
        self.fail_on_error
    }
}
