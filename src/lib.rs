#![allow(clippy::new_without_default)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

pub mod asset_db;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod image_asset;
pub mod import_data;
pub mod logs;
pub mod storage;
pub mod thumbnail;
pub mod thumbnail_cache;
pub mod trail_analyzer;
pub mod utils;

pub use error::{Error, Result};
