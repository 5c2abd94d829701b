use anyhow::Context;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

const TENANT_PREFIX: &str = "t_";
const COLLECTION_PREFIX: &str = "c_";

/// Tenant and collection enumeration backed by the data-directory layout:
/// `{data_dir}/t_{tenant}/c_{collection}/`. Names are derivable from the
/// path; the collection manifest records them as well.
pub struct Catalog {
    data_dir: PathBuf,
}

impl Catalog {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn tenant_dir(&self, tenant: &str) -> PathBuf {
        self.data_dir.join(format!("{TENANT_PREFIX}{tenant}"))
    }

    pub fn collection_dir(&self, tenant: &str, name: &str) -> PathBuf {
        self.tenant_dir(tenant)
            .join(format!("{COLLECTION_PREFIX}{name}"))
    }

    pub fn collection_exists(&self, tenant: &str, name: &str) -> bool {
        self.collection_dir(tenant, name).is_dir()
    }

    /// Tenants with at least one collection directory, sorted.
    pub fn list_tenants(&self) -> EngineResult<Vec<String>> {
        let mut tenants = Vec::new();
        for name in subdirs(&self.data_dir)? {
            if let Some(tenant) = name.strip_prefix(TENANT_PREFIX) {
                tenants.push(tenant.to_string());
            }
        }
        tenants.sort();
        Ok(tenants)
    }

    /// Collections of a tenant, sorted. A tenant exists only while it has
    /// collections, so an absent directory is `not_found`.
    pub fn list_collections(&self, tenant: &str) -> EngineResult<Vec<String>> {
        let dir = self.tenant_dir(tenant);
        if !dir.is_dir() {
            return Err(EngineError::NotFound(format!("tenant '{tenant}'")));
        }
        let mut collections = Vec::new();
        for name in subdirs(&dir)? {
            if let Some(collection) = name.strip_prefix(COLLECTION_PREFIX) {
                collections.push(collection.to_string());
            }
        }
        collections.sort();
        Ok(collections)
    }
}

fn subdirs(dir: &Path) -> EngineResult<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))
        .map_err(EngineError::Internal)?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))
            .map_err(EngineError::Internal)?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_tenant_and_collection_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(tmp.path());

        std::fs::create_dir_all(catalog.collection_dir("acme", "docs")).unwrap();
        std::fs::create_dir_all(catalog.collection_dir("acme", "books")).unwrap();
        std::fs::create_dir_all(catalog.collection_dir("globex", "wiki")).unwrap();
        // non-conforming directories are ignored
        std::fs::create_dir_all(tmp.path().join("stray")).unwrap();

        assert_eq!(catalog.list_tenants().unwrap(), vec!["acme", "globex"]);
        assert_eq!(
            catalog.list_collections("acme").unwrap(),
            vec!["books", "docs"]
        );
        assert!(catalog.collection_exists("globex", "wiki"));
        assert!(!catalog.collection_exists("globex", "docs"));
    }

    #[test]
    fn missing_tenant_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(tmp.path());
        let err = catalog.list_collections("ghost").unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn empty_data_dir_lists_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(tmp.path().join("does-not-exist-yet"));
        assert!(catalog.list_tenants().unwrap().is_empty());
    }
}
