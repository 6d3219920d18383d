pub mod test_utils;

use anyhow::Result;
use attractions_core::{
    asset_db::{AssetDb, AssetRepository, InsertOutcome},
    config::Config,
    image_asset::{AssetId, ImageAsset, NewImageAsset, ThumbSize},
    storage::Storage,
    Error,
};
use image::GenericImageView;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn upload(storage: &Storage, width: u32, height: u32) -> ImageAsset {
    storage
        .upload_image(&test_utils::png(width, height), "image/png", None)
        .unwrap()
}

#[test]
fn creates_thumbnail_once() {
    let env = test_utils::setup("thumbnail_cache-once");
    let original = upload(&env.storage, 1200, 600);
    assert_eq!(env.blob_store.puts(), 1);

    let thumbnails = env.storage.thumbnails();
    let thumb = thumbnails
        .get_or_create_thumbnail(&original, ThumbSize::square(300))
        .unwrap();
    assert_eq!(thumb.parent_id(), Some(original.id));
    assert_eq!(thumb.derivation.unwrap().requested, ThumbSize::square(300));
    assert_eq!((thumb.width, thumb.height), (300, 150));
    assert_eq!(env.blob_store.puts(), 2);
    assert_eq!(env.blob_store.gets(), 1);
    assert!(thumb.key.ends_with(".png"));

    // the stored bytes are the real thumbnail
    assert!(env.blob_store.exists(&thumb));
    let stored = std::fs::read(
        env.dir
            .path()
            .join("blobs")
            .join(&thumb.bucket)
            .join(&thumb.key),
    )
    .unwrap();
    assert_eq!(stored.len() as u64, thumb.size);
    assert_eq!(
        image::load_from_memory(&stored).unwrap().dimensions(),
        (300, 150)
    );

    // second call is served from the repository
    let again = thumbnails
        .get_or_create_thumbnail(&original, ThumbSize::square(300))
        .unwrap();
    assert_eq!(again, thumb);
    assert_eq!(env.blob_store.puts(), 2);
    assert_eq!(env.blob_store.gets(), 1);
}

#[test]
fn no_upscale() {
    let env = test_utils::setup("thumbnail_cache-no_upscale");
    let original = upload(&env.storage, 300, 900);
    let thumbnails = env.storage.thumbnails();

    assert_eq!(thumbnails.thumb_300(&original).unwrap(), original);
    assert_eq!(thumbnails.thumb_600(&original).unwrap(), original);
    assert_eq!(env.blob_store.puts(), 1);
    assert_eq!(env.blob_store.gets(), 0);
    assert!(env.asset_db.list_thumbnails(original.id).unwrap().is_empty());
}

#[test]
fn thumbnails_are_never_thumbnailed() {
    let env = test_utils::setup("thumbnail_cache-derived");
    let original = upload(&env.storage, 1200, 1200);
    let thumbnails = env.storage.thumbnails();
    let thumb = thumbnails.thumb_600(&original).unwrap();

    let result = thumbnails.landscape_thumb(&thumb, 300);
    assert!(matches!(result, Err(Error::InvalidOperation(_))));
    // even when the size would be a no-op
    let result = thumbnails.landscape_thumb(&thumb, 2000);
    assert!(matches!(result, Err(Error::InvalidOperation(_))));
}

#[test]
fn sizes_are_cached_separately() {
    let env = test_utils::setup("thumbnail_cache-sizes");
    let original = upload(&env.storage, 1000, 500);
    let thumbnails = env.storage.thumbnails();

    let small = thumbnails.thumb_300(&original).unwrap();
    let large = thumbnails.thumb_600(&original).unwrap();
    let wide = thumbnails
        .get_or_create_thumbnail(
            &original,
            ThumbSize {
                width: 900,
                height: 100,
            },
        )
        .unwrap();
    assert_ne!(small.key, large.key);
    assert_eq!((large.width, large.height), (600, 300));
    assert_eq!((wide.width, wide.height), (200, 100));
    assert_eq!(env.asset_db.list_thumbnails(original.id).unwrap().len(), 3);
}

#[test]
fn resolve_many_mixed() {
    let env = test_utils::setup("thumbnail_cache-resolve_many");
    let fits = upload(&env.storage, 200, 200);
    let cached = upload(&env.storage, 1200, 800);
    let cold = upload(&env.storage, 900, 900);
    let thumbnails = env.storage.thumbnails();
    let cached_thumb = thumbnails.thumb_300(&cached).unwrap();

    let puts_before = env.blob_store.puts();
    let ids: HashSet<AssetId> = [fits.id, cached.id, cold.id].into_iter().collect();
    let resolved = thumbnails.resolve_many(&ids, 300).unwrap();

    assert_eq!(resolved.len(), 3);
    assert_eq!(resolved[&fits.id], fits);
    assert_eq!(resolved[&cached.id], cached_thumb);
    let cold_thumb = &resolved[&cold.id];
    assert_eq!(cold_thumb.parent_id(), Some(cold.id));
    assert_eq!((cold_thumb.width, cold_thumb.height), (300, 300));
    assert_eq!(env.blob_store.puts() - puts_before, 1);

    // everything is warm now
    let resolved_again = thumbnails.resolve_many(&ids, 300).unwrap();
    assert_eq!(resolved_again, resolved);
    assert_eq!(env.blob_store.puts() - puts_before, 1);
}

#[test]
fn resolve_many_agrees_with_single_lookup() {
    let env = test_utils::setup("thumbnail_cache-resolve_many_single");
    // taller than the box but not wider: used as is
    let tall = upload(&env.storage, 300, 1200);
    let thumbnails = env.storage.thumbnails();
    let ids: HashSet<AssetId> = [tall.id].into_iter().collect();

    let resolved = thumbnails.resolve_many(&ids, 300).unwrap();
    assert_eq!(resolved[&tall.id], thumbnails.thumb_300(&tall).unwrap());
    assert_eq!(resolved[&tall.id], tall);
}

#[test]
fn resolve_many_edge_cases() {
    let env = test_utils::setup("thumbnail_cache-resolve_many_edge");
    let thumbnails = env.storage.thumbnails();
    assert!(thumbnails.resolve_many(&HashSet::new(), 300).unwrap().is_empty());

    let ids: HashSet<AssetId> = [12345].into_iter().collect();
    assert!(matches!(
        thumbnails.resolve_many(&ids, 300),
        Err(Error::NotFound(12345))
    ));
}

#[test]
fn missing_origin() {
    let env = test_utils::setup("thumbnail_cache-missing_origin");
    let original = upload(&env.storage, 1200, 800);
    std::fs::remove_file(
        env.dir
            .path()
            .join("blobs")
            .join(&original.bucket)
            .join(&original.key),
    )
    .unwrap();

    let result = env.storage.thumbnails().thumb_300(&original);
    match result {
        Err(e @ Error::SourceUnavailable(_)) => assert!(e.is_retryable()),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(env.asset_db.list_thumbnails(original.id).unwrap().is_empty());
}

#[test]
fn slow_origin_times_out() {
    let env = test_utils::setup_with(
        "thumbnail_cache-timeout",
        test_utils::config_with_timeout(50),
        test_utils::Delays {
            get: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    );
    let original = upload(&env.storage, 1200, 800);

    let result = env.storage.thumbnails().thumb_300(&original);
    match result {
        Err(Error::SourceUnavailable(message)) => {
            assert!(message.contains("timed out"), "{message}")
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(env.blob_store.puts(), 1);
}

#[test]
fn slow_upload_is_cleaned_up() {
    let env = test_utils::setup_with(
        "thumbnail_cache-slow_upload",
        test_utils::config_with_timeout(100),
        test_utils::Delays {
            put: Some(Duration::from_millis(400)),
            ..Default::default()
        },
    );
    let original = upload(&env.storage, 1200, 800);
    assert_eq!(test_utils::stored_blobs(&env), 1);

    let result = env.storage.thumbnails().thumb_300(&original);
    match result {
        Err(Error::SourceUnavailable(message)) => {
            assert!(message.contains("uploading thumbnail"), "{message}")
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // the upload finishes in the background and is removed right away
    std::thread::sleep(Duration::from_millis(800));
    assert_eq!(env.blob_store.puts(), 2);
    assert_eq!(env.blob_store.deletes(), 1);
    assert_eq!(test_utils::stored_blobs(&env), 1);
    assert!(env.asset_db.list_thumbnails(original.id).unwrap().is_empty());
}

#[test]
fn not_an_image() {
    let env = test_utils::setup("thumbnail_cache-not_an_image");
    let result = env
        .storage
        .upload_image(b"GIF89a but not really", "image/gif", None);
    assert!(matches!(result, Err(Error::Image(_))));
    assert_eq!(env.blob_store.puts(), 0);
}

/// Pretends another request recorded the thumbnail between our lookup and
/// our insert.
struct RacingRepository {
    inner: Arc<AssetDb>,
    raced: AtomicBool,
}

impl AssetRepository for RacingRepository {
    fn get(&self, id: AssetId) -> Result<Option<ImageAsset>> {
        self.inner.get(id)
    }

    fn find_thumbnail(&self, parent_id: AssetId, size: ThumbSize) -> Result<Option<ImageAsset>> {
        self.inner.find_thumbnail(parent_id, size)
    }

    fn insert(&self, asset: NewImageAsset) -> Result<InsertOutcome> {
        if asset.derivation.is_some() && !self.raced.swap(true, Ordering::SeqCst) {
            let winner = NewImageAsset {
                key: format!("{}-winner", asset.key),
                ..asset.clone()
            };
            assert!(matches!(
                self.inner.insert(winner)?,
                InsertOutcome::Inserted(_)
            ));
        }
        self.inner.insert(asset)
    }

    fn query_for_size(&self, ids: &[AssetId], size: u32) -> Result<Vec<ImageAsset>> {
        self.inner.query_for_size(ids, size)
    }

    fn list_thumbnails(&self, parent_id: AssetId) -> Result<Vec<ImageAsset>> {
        self.inner.list_thumbnails(parent_id)
    }

    fn delete(&self, id: AssetId) -> Result<bool> {
        self.inner.delete(id)
    }
}

#[test]
fn lost_race_returns_winner() {
    let env = test_utils::setup("thumbnail_cache-race");
    let original = upload(&env.storage, 1200, 800);

    let racing = Arc::new(RacingRepository {
        inner: env.asset_db.clone(),
        raced: AtomicBool::new(false),
    });
    let storage = Storage::with_backends(racing, env.blob_store.clone(), Config::default());

    let thumb = storage.thumbnails().thumb_300(&original).unwrap();
    assert!(thumb.key.ends_with("-winner"), "{}", thumb.key);
    assert_eq!(env.asset_db.list_thumbnails(original.id).unwrap(), vec![thumb]);
    // our own upload was cleaned up
    assert_eq!(env.blob_store.deletes(), 1);
}

#[test]
fn concurrent_requests_record_one_thumbnail() {
    let env = test_utils::setup("thumbnail_cache-concurrent");
    let original = upload(&env.storage, 1600, 1200);
    let storage = Arc::new(env.storage);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let storage = storage.clone();
            let original = original.clone();
            std::thread::spawn(move || storage.thumbnails().thumb_600(&original).unwrap())
        })
        .collect();
    let results: Vec<ImageAsset> = handles.into_iter().map(|x| x.join().unwrap()).collect();

    assert!(results.iter().all(|x| x == &results[0]));
    assert_eq!(
        env.asset_db.list_thumbnails(original.id).unwrap(),
        vec![results[0].clone()]
    );
}
