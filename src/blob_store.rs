use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::AssetsConfig;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobKey {
    pub bucket: String,
    pub key: String,
}

/* Object storage holding image bytes. It must be read-after-write consistent,
   otherwise a freshly recorded thumbnail could point at nothing.

   Implementations are called from worker threads (see `ThumbnailCache`), hence
   `Send + Sync`.
*/
pub trait BlobStore: Send + Sync {
    fn put(&self, data: &[u8], content_type: &str) -> Result<BlobKey>;
    fn get(&self, key: &BlobKey) -> Result<Vec<u8>>;
    fn delete(&self, key: &BlobKey) -> Result<()>;
}

pub fn extension_of_content_type(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

pub fn generate_key(prefix: &str, content_type: &str) -> String {
    format!(
        "{}images/{}.{}",
        prefix,
        Uuid::new_v4().as_hyphenated(),
        extension_of_content_type(content_type)
    )
}

/// Keeps objects on the local file system as `<root>/<bucket>/<key>`.
pub struct FsBlobStore {
    root: PathBuf,
    bucket: String,
    prefix: String,
}

impl FsBlobStore {
    pub fn open<P: AsRef<Path>>(root: P, config: &AssetsConfig) -> Result<FsBlobStore> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(&config.bucket))
            .with_context(|| format!("creating blob root {:?}", root))?;
        Ok(FsBlobStore {
            root,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
        })
    }

    fn path_of(&self, key: &BlobKey) -> Result<PathBuf> {
        // keys come from the metadata db, still refuse to escape the root
        if key.key.split('/').any(|x| x == ".." || x.is_empty())
            || key.bucket.contains('/')
            || key.bucket == ".."
        {
            bail!("invalid blob key: {}/{}", key.bucket, key.key);
        }
        Ok(self.root.join(&key.bucket).join(&key.key))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, data: &[u8], content_type: &str) -> Result<BlobKey> {
        let key = BlobKey {
            bucket: self.bucket.clone(),
            key: generate_key(&self.prefix, content_type),
        };
        let path = self.path_of(&key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data).with_context(|| format!("writing blob {:?}", path))?;
        debug!("[blob_store] stored {} bytes at {}", data.len(), key.key);
        Ok(key)
    }

    fn get(&self, key: &BlobKey) -> Result<Vec<u8>> {
        let path = self.path_of(key)?;
        fs::read(&path).with_context(|| format!("reading blob {}/{}", key.bucket, key.key))
    }

    fn delete(&self, key: &BlobKey) -> Result<()> {
        let path = self.path_of(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            // deleting twice is fine, S3 behaves the same
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting blob {:?}", path)),
        }
    }
}
