use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

pub const SUBMISSIONS_BUCKET: &str = "assignment-submissions";
pub const ATTACHMENTS_BUCKET: &str = "assignment-attachments";
pub const MATERIALS_BUCKET: &str = "study-materials";

/// Workspace-local object store. Metadata rows record `<bucket>/<key>`; the
/// first path segment is the bucket, the rest is the object key.
pub struct ObjectStore {
    root: PathBuf,
}

pub fn split_bucket_key(file_path: &str) -> Option<(&str, &str)> {
    let (bucket, key) = file_path.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket, key))
}

impl ObjectStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            root: workspace.join("storage"),
        }
    }

    /// Copies `source` into the store and returns (file_path, size_bytes).
    pub fn upload(&self, bucket: &str, key: &str, source: &Path) -> anyhow::Result<(String, u64)> {
        let dest = self.root.join(bucket).join(key);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create bucket dir for {}/{}", bucket, key))?;
        }
        let size = std::fs::copy(source, &dest)
            .with_context(|| format!("copy {} into {}/{}", source.display(), bucket, key))?;
        Ok((format!("{}/{}", bucket, key), size))
    }

    /// Absolute on-disk path for a stored object (public-URL analog).
    pub fn object_path(&self, file_path: &str) -> anyhow::Result<PathBuf> {
        let Some((bucket, key)) = split_bucket_key(file_path) else {
            bail!("malformed file path: {}", file_path);
        };
        Ok(self.root.join(bucket).join(key))
    }

    /// Removes a stored object. Fails if the object is absent so callers can
    /// keep the metadata row when the storage side did not go through.
    pub fn remove(&self, file_path: &str) -> anyhow::Result<()> {
        let path = self.object_path(file_path)?;
        std::fs::remove_file(&path)
            .with_context(|| format!("remove stored object {}", file_path))?;
        Ok(())
    }
}
