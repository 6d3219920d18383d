#![allow(dead_code)]

use anyhow::Result;
use attractions_core::{
    asset_db::AssetDb,
    blob_store::{BlobKey, BlobStore, FsBlobStore},
    config::{AssetsConfig, Config},
    image_asset::ImageAsset,
    storage::Storage,
    trail_analyzer::GeoPoint,
};
use flate2::{write::GzEncoder, Compression};
use image::{DynamicImage, ImageFormat};
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempdir::TempDir;

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn trail_csv(points: &[GeoPoint]) -> String {
    let mut csv = String::from("Latitude,Longitude,Altitude\n");
    for point in points {
        csv.push_str(&format!(
            "{},{},{}\n",
            point.latitude, point.longitude, point.altitude
        ));
    }
    csv
}

pub fn trail_gzip_csv(points: &[GeoPoint]) -> Vec<u8> {
    gzip(trail_csv(points).as_bytes())
}

/// A walk heading north-east from Jerusalem, altitude given per step.
pub fn walk(altitudes: impl IntoIterator<Item = f64>) -> Vec<GeoPoint> {
    altitudes
        .into_iter()
        .enumerate()
        .map(|(i, altitude)| GeoPoint {
            latitude: 31.8 + i as f64 * 0.0001,
            longitude: 35.25 + i as f64 * 0.00005,
            altitude,
        })
        .collect()
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let mut buffer = Vec::new();
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    buffer
}

/// Wraps a real store and counts calls. Calls can be slowed down, deletes
/// can be made to fail.
pub struct CountingBlobStore {
    inner: FsBlobStore,
    pub puts: AtomicUsize,
    pub gets: AtomicUsize,
    pub deletes: AtomicUsize,
    pub fail_deletes: AtomicBool,
    get_delay: Option<Duration>,
    put_delay: Option<Duration>,
}

impl CountingBlobStore {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn exists(&self, asset: &ImageAsset) -> bool {
        self.inner
            .get(&BlobKey {
                bucket: asset.bucket.clone(),
                key: asset.key.clone(),
            })
            .is_ok()
    }
}

impl BlobStore for CountingBlobStore {
    fn put(&self, data: &[u8], content_type: &str) -> Result<BlobKey> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.put_delay {
            std::thread::sleep(delay);
        }
        self.inner.put(data, content_type)
    }

    fn get(&self, key: &BlobKey) -> Result<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.get_delay {
            std::thread::sleep(delay);
        }
        self.inner.get(key)
    }

    fn delete(&self, key: &BlobKey) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("delete refused: {}", key.key);
        }
        self.inner.delete(key)
    }
}

pub struct TestEnv {
    pub dir: TempDir,
    pub asset_db: Arc<AssetDb>,
    pub blob_store: Arc<CountingBlobStore>,
    pub storage: Storage,
}

#[derive(Default)]
pub struct Delays {
    pub get: Option<Duration>,
    pub put: Option<Duration>,
}

pub fn setup_with(name: &str, config: Config, delays: Delays) -> TestEnv {
    let dir = TempDir::new(name).unwrap();
    println!("temp dir: {:?}", dir.path());
    let support_dir = dir.path().join("support");
    std::fs::create_dir(&support_dir).unwrap();

    let asset_db = Arc::new(AssetDb::open(support_dir.to_str().unwrap()).unwrap());
    let blob_store = Arc::new(CountingBlobStore {
        inner: FsBlobStore::open(dir.path().join("blobs"), &config.assets).unwrap(),
        puts: AtomicUsize::new(0),
        gets: AtomicUsize::new(0),
        deletes: AtomicUsize::new(0),
        fail_deletes: AtomicBool::new(false),
        get_delay: delays.get,
        put_delay: delays.put,
    });
    let storage = Storage::with_backends(asset_db.clone(), blob_store.clone(), config);
    TestEnv {
        dir,
        asset_db,
        blob_store,
        storage,
    }
}

pub fn setup(name: &str) -> TestEnv {
    setup_with(name, Config::default(), Delays::default())
}

/// Files currently in the blob store, thumbnails and originals alike.
pub fn stored_blobs(env: &TestEnv) -> usize {
    let images = env
        .dir
        .path()
        .join("blobs")
        .join(&env.storage.config().assets.bucket)
        .join("images");
    match std::fs::read_dir(images) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

pub fn config_with_timeout(io_timeout_ms: u64) -> Config {
    Config {
        assets: AssetsConfig {
            io_timeout_ms,
            ..AssetsConfig::default()
        },
        ..Config::default()
    }
}
