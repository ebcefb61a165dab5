use std::fs;
use std::path::{Path, PathBuf};

use riskshield_core::{PipelineError, Result};
use tracing::info;

/// Makes a finished report reachable and returns where it can be fetched.
pub trait ReportStorage: Send + Sync {
    fn publish(&self, path: &Path, name: &str) -> Result<String>;
}

/// Serves reports from a local directory through the `/report/{name}`
/// route.
pub struct LocalReportStore {
    root: PathBuf,
    base_url: String,
}

impl LocalReportStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a public report name to its file, refusing anything that
    /// could step outside the store.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return None;
        }
        let path = self.root.join(name);
        path.is_file().then_some(path)
    }
}

impl ReportStorage for LocalReportStore {
    fn publish(&self, path: &Path, name: &str) -> Result<String> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(PipelineError::StorageUpload(format!(
                "invalid report name {name:?}"
            )));
        }
        let target = self.root.join(name);
        if path != target {
            fs::create_dir_all(&self.root)
                .map_err(|e| PipelineError::StorageUpload(e.to_string()))?;
            fs::copy(path, &target).map_err(|e| PipelineError::StorageUpload(e.to_string()))?;
        } else if !target.is_file() {
            return Err(PipelineError::StorageUpload(format!(
                "report {name} is missing"
            )));
        }
        let url = format!("{}/report/{}", self.base_url, name);
        info!(report = name, "report published");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_in_place_and_builds_url() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("r.pdf");
        fs::write(&file, b"%PDF").unwrap();
        let store = LocalReportStore::new(dir.path(), "https://host/");
        assert_eq!(store.publish(&file, "r.pdf").unwrap(), "https://host/report/r.pdf");
        assert_eq!(store.resolve("r.pdf"), Some(file));
    }

    #[test]
    fn copies_reports_written_elsewhere() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let file = src.path().join("r.pdf");
        fs::write(&file, b"%PDF").unwrap();
        let store = LocalReportStore::new(dst.path(), "http://localhost:8000");
        store.publish(&file, "r.pdf").unwrap();
        assert!(dst.path().join("r.pdf").is_file());
    }

    #[test]
    fn refuses_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalReportStore::new(dir.path(), "http://localhost");
        assert!(store.resolve("../etc/passwd").is_none());
        assert!(store.resolve("missing.pdf").is_none());
        assert!(matches!(
            store.publish(&dir.path().join("x"), "../x"),
            Err(PipelineError::StorageUpload(_))
        ));
    }
}
