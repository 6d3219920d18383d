use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::asset_db::{AssetDb, AssetRepository, InsertOutcome};
use crate::blob_store::{BlobKey, BlobStore, FsBlobStore};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::image_asset::{ImageAsset, NewImageAsset};
use crate::import_data;
use crate::thumbnail;
use crate::thumbnail_cache::ThumbnailCache;
use crate::trail_analyzer::TrailSummary;

// The entry point for the request handlers: everything they need from the
// core, wired from one `Config`.
pub struct Storage {
    config: Config,
    thumbnail_cache: ThumbnailCache,
}

impl Storage {
    pub fn init(support_dir: &str, blob_dir: &str, config: Config) -> Result<Self> {
        let asset_db = AssetDb::open(support_dir)?;
        let blob_store = FsBlobStore::open(Path::new(blob_dir), &config.assets)?;
        info!(
            "[storage] initialized: support_dir={}, blob_dir={}, bucket={}",
            support_dir, blob_dir, config.assets.bucket
        );
        Ok(Self::with_backends(
            Arc::new(asset_db),
            Arc::new(blob_store),
            config,
        ))
    }

    pub fn with_backends(
        repository: Arc<dyn AssetRepository>,
        blob_store: Arc<dyn BlobStore>,
        config: Config,
    ) -> Self {
        let thumbnail_cache = ThumbnailCache::new(repository, blob_store, &config.assets);
        Storage {
            config,
            thumbnail_cache,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn thumbnails(&self) -> &ThumbnailCache {
        &self.thumbnail_cache
    }

    pub fn cdn(&self) -> Option<&str> {
        self.config.assets.cdn.as_deref()
    }

    pub fn analyze_trail<R: Read>(&self, gzip_csv: R) -> Result<TrailSummary> {
        import_data::analyze_gzip_csv(gzip_csv, &self.config.trail)
    }

    /// Stores a newly uploaded original. When the upload fills an image slot
    /// that already had an image, `replaces` is deleted once the new one is
    /// recorded.
    pub fn upload_image(
        &self,
        data: &[u8],
        content_type: &str,
        replaces: Option<&ImageAsset>,
    ) -> Result<ImageAsset> {
        let (width, height) = thumbnail::probe_dimensions(data)?;
        let blob_store = self.thumbnail_cache.blob_store();
        let stored = blob_store
            .put(data, content_type)
            .map_err(|e| Error::SourceUnavailable(format!("uploading image: {:#}", e)))?;

        let new_asset = NewImageAsset {
            bucket: stored.bucket.clone(),
            key: stored.key.clone(),
            size: data.len() as u64,
            width,
            height,
            derivation: None,
        };
        let asset = match self.thumbnail_cache.repository().insert(new_asset) {
            Ok(InsertOutcome::Inserted(asset)) => asset,
            // the key belongs to the recorded row, its blob must stay
            Ok(InsertOutcome::Duplicate) => {
                return Err(Error::Storage(anyhow!(
                    "image key already recorded: {}/{}",
                    stored.bucket,
                    stored.key
                )))
            }
            Err(e) => {
                if let Err(delete_error) = blob_store.delete(&stored) {
                    warn!(
                        "[storage] failed to delete unrecorded upload {}: {:#}",
                        stored.key, delete_error
                    );
                }
                return Err(Error::Storage(e));
            }
        };

        // the new image is recorded, a failed cleanup must not lose it
        if let Some(old_asset) = replaces {
            if let Err(e) = self.delete_image(old_asset) {
                warn!(
                    "[storage] failed to delete replaced image asset {}: {}",
                    old_asset.id, e
                );
            }
        }
        Ok(asset)
    }

    /// Deletes an image with its blob. For an original, all its thumbnails
    /// go with it. Rows go first, blobs left behind by a failed delete are
    /// only logged.
    pub fn delete_image(&self, asset: &ImageAsset) -> Result<()> {
        let repository = self.thumbnail_cache.repository();
        let blob_store = self.thumbnail_cache.blob_store();

        let mut doomed = if asset.is_original() {
            repository.list_thumbnails(asset.id)?
        } else {
            Vec::new()
        };
        doomed.push(asset.clone());

        if !repository.delete(asset.id)? {
            warn!("[storage] image asset {} was already deleted", asset.id);
        }

        for asset in &doomed {
            let key = BlobKey {
                bucket: asset.bucket.clone(),
                key: asset.key.clone(),
            };
            if let Err(e) = blob_store.delete(&key) {
                warn!(
                    "[storage] failed to delete blob {}/{}: {:#}",
                    key.bucket, key.key, e
                );
            }
        }

        info!(
            "[storage] deleted image asset {} ({} thumbnails)",
            asset.id,
            doomed.len() - 1
        );
        Ok(())
    }
}
