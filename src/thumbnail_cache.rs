use std::collections::{HashMap, HashSet};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::asset_db::{AssetRepository, InsertOutcome};
use crate::blob_store::{BlobKey, BlobStore};
use crate::config::AssetsConfig;
use crate::error::{Error, Result};
use crate::image_asset::{AssetId, Derivation, ImageAsset, NewImageAsset, ThumbSize};
use crate::thumbnail::{self, THUMBNAIL_CONTENT_TYPE};

/// Lazily generated, persisted thumbnails of original images.
///
/// A thumbnail is generated the first time a size is requested for an
/// original and looked up in the repository afterwards. There is no lock
/// around generation: two requests missing the same thumbnail at the same
/// time both render and upload it, the repository's unique constraint lets
/// only one of them be recorded and the other one returns the recorded row.
pub struct ThumbnailCache {
    repository: Arc<dyn AssetRepository>,
    blob_store: Arc<dyn BlobStore>,
    io_timeout: Duration,
    cold_cache_warn_threshold: usize,
}

impl ThumbnailCache {
    pub fn new(
        repository: Arc<dyn AssetRepository>,
        blob_store: Arc<dyn BlobStore>,
        config: &AssetsConfig,
    ) -> Self {
        ThumbnailCache {
            repository,
            blob_store,
            io_timeout: config.io_timeout(),
            cold_cache_warn_threshold: config.cold_cache_warn_threshold,
        }
    }

    pub fn landscape_thumb(&self, original: &ImageAsset, width: u32) -> Result<ImageAsset> {
        self.get_or_create_thumbnail(original, ThumbSize::square(width))
    }

    pub fn thumb_300(&self, original: &ImageAsset) -> Result<ImageAsset> {
        self.landscape_thumb(original, 300)
    }

    pub fn thumb_600(&self, original: &ImageAsset) -> Result<ImageAsset> {
        self.landscape_thumb(original, 600)
    }

    pub fn get_or_create_thumbnail(
        &self,
        original: &ImageAsset,
        target: ThumbSize,
    ) -> Result<ImageAsset> {
        if let Some(derivation) = &original.derivation {
            return Err(Error::InvalidOperation(format!(
                "thumbnail requested for image asset {} which is itself a thumbnail of {}",
                original.id, derivation.parent_id
            )));
        }

        if target.width >= original.width {
            return Ok(original.clone());
        }

        if let Some(thumbnail) = self.repository.find_thumbnail(original.id, target)? {
            return Ok(thumbnail);
        }

        self.create_thumbnail(original, target)
    }

    fn create_thumbnail(&self, original: &ImageAsset, target: ThumbSize) -> Result<ImageAsset> {
        debug!(
            "[thumbnail_cache] generating {}x{} thumbnail of {}",
            target.width, target.height, original.id
        );
        let source_key = BlobKey {
            bucket: original.bucket.clone(),
            key: original.key.clone(),
        };
        let source = self.run_blob_call(
            "fetching original",
            move |store| store.get(&source_key),
            |_, _| (),
        )?;
        let rendered = thumbnail::render_thumbnail(&source, target)?;

        let size = rendered.data.len() as u64;
        let (width, height) = (rendered.width, rendered.height);
        let data = rendered.data;
        let stored = self.run_blob_call(
            "uploading thumbnail",
            move |store| store.put(&data, THUMBNAIL_CONTENT_TYPE),
            |store, stored| {
                info!(
                    "[thumbnail_cache] deleting thumbnail {} uploaded after timeout",
                    stored.key
                );
                if let Err(e) = store.delete(&stored) {
                    warn!(
                        "[thumbnail_cache] failed to delete orphan thumbnail {}: {:#}",
                        stored.key, e
                    );
                }
            },
        )?;

        let new_asset = NewImageAsset {
            bucket: stored.bucket.clone(),
            key: stored.key.clone(),
            size,
            width,
            height,
            derivation: Some(Derivation {
                parent_id: original.id,
                requested: target,
            }),
        };
        match self.repository.insert(new_asset)? {
            InsertOutcome::Inserted(thumbnail) => Ok(thumbnail),
            InsertOutcome::Duplicate => {
                info!(
                    "[thumbnail_cache] lost the race for {}x{} thumbnail of {}, using the recorded one",
                    target.width, target.height, original.id
                );
                if let Err(e) = self.blob_store.delete(&stored) {
                    warn!(
                        "[thumbnail_cache] failed to delete orphan thumbnail {}: {:#}",
                        stored.key, e
                    );
                }
                self.repository
                    .find_thumbnail(original.id, target)?
                    .ok_or_else(|| {
                        Error::Storage(anyhow!(
                            "thumbnail of {} reported as duplicate but not found",
                            original.id
                        ))
                    })
            }
        }
    }

    /// Thumbnails of `size` for a whole list of originals.
    ///
    /// Existing thumbnails (and originals small enough to be used as they are)
    /// are fetched with a single query; only the remaining ones go through
    /// `get_or_create_thumbnail` one by one.
    pub fn resolve_many(
        &self,
        original_ids: &HashSet<AssetId>,
        size: u32,
    ) -> Result<HashMap<AssetId, ImageAsset>> {
        let ids: Vec<AssetId> = original_ids.iter().copied().collect();
        let mut resolved: HashMap<AssetId, ImageAsset> = HashMap::with_capacity(ids.len());

        for asset in self.repository.query_for_size(&ids, size)? {
            match asset.parent_id() {
                // the original itself wins over a thumbnail, same as
                // `get_or_create_thumbnail` would decide
                None => {
                    resolved.insert(asset.id, asset);
                }
                Some(parent_id) => {
                    resolved.entry(parent_id).or_insert(asset);
                }
            }
        }

        let missing: Vec<AssetId> = ids
            .into_iter()
            .filter(|id| !resolved.contains_key(id))
            .collect();
        if !missing.is_empty() {
            if missing.len() >= self.cold_cache_warn_threshold {
                warn!(
                    "[thumbnail_cache] {} of {} thumbnails of size {} missing, cache is cold",
                    missing.len(),
                    original_ids.len(),
                    size
                );
            } else {
                info!(
                    "[thumbnail_cache] {} of {} thumbnails of size {} missing",
                    missing.len(),
                    original_ids.len(),
                    size
                );
            }
        }

        let target = ThumbSize::square(size);
        for id in missing {
            let original = self.repository.get(id)?.ok_or(Error::NotFound(id))?;
            let thumbnail = self.get_or_create_thumbnail(&original, target)?;
            resolved.insert(id, thumbnail);
        }

        Ok(resolved)
    }

    // Blob calls run on their own thread so a stuck origin cannot hold the
    // request forever. On timeout the thread is left behind; whatever it
    // produces after we gave up is handed to `abandon`.
    fn run_blob_call<T, F, C>(&self, what: &str, f: F, abandon: C) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn BlobStore) -> anyhow::Result<T> + Send + 'static,
        C: FnOnce(&dyn BlobStore, T) + Send + 'static,
    {
        let blob_store = Arc::clone(&self.blob_store);
        // set under the lock on timeout, the worker sends while holding it
        let gave_up = Arc::new(Mutex::new(false));
        let (tx, rx) = mpsc::channel();
        {
            let gave_up = Arc::clone(&gave_up);
            thread::spawn(move || {
                let result = f(blob_store.as_ref());
                match gave_up.lock() {
                    Ok(gave_up) if !*gave_up => {
                        let _ = tx.send(result);
                    }
                    _ => {
                        if let Ok(value) = result {
                            abandon(blob_store.as_ref(), value);
                        }
                    }
                }
            });
        }

        let received = match rx.recv_timeout(self.io_timeout) {
            Ok(result) => Some(result),
            Err(mpsc::RecvTimeoutError::Timeout) => match gave_up.lock() {
                Ok(mut gave_up) => {
                    *gave_up = true;
                    // it may have landed right before we took the lock
                    rx.try_recv().ok()
                }
                Err(_) => None,
            },
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(Error::SourceUnavailable(format!(
                    "{}: blob store call panicked",
                    what
                )))
            }
        };

        match received {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(Error::SourceUnavailable(format!("{}: {:#}", what, e))),
            None => Err(Error::SourceUnavailable(format!(
                "{}: timed out after {:?}",
                what, self.io_timeout
            ))),
        }
    }

    pub(crate) fn repository(&self) -> &Arc<dyn AssetRepository> {
        &self.repository
    }

    pub(crate) fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blob_store
    }
}
