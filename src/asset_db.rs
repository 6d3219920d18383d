use anyhow::Result;
use itertools::Itertools;
use rusqlite::{ffi, params_from_iter, types::Value, Connection, OptionalExtension, Row, Transaction};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::image_asset::{AssetId, Derivation, ImageAsset, NewImageAsset, ThumbSize};
use crate::utils;

/* Metadata of every stored image. Originals have no parent; derived
thumbnails point at their original and remember the size they were requested
for. The `(parent_id, request_width, request_height)` unique constraint is what
keeps concurrent thumbnail generation from recording the same thumbnail twice,
so the cache relies on `insert` reporting `Duplicate` instead of failing.
*/

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(ImageAsset),
    /// Another row already holds the same (parent, requested size) or
    /// (bucket, key).
    Duplicate,
}

pub trait AssetRepository: Send + Sync {
    fn get(&self, id: AssetId) -> Result<Option<ImageAsset>>;

    fn find_thumbnail(&self, parent_id: AssetId, size: ThumbSize) -> Result<Option<ImageAsset>>;

    fn insert(&self, asset: NewImageAsset) -> Result<InsertOutcome>;

    /// One round trip for a whole list: the square `size` thumbnails of the
    /// given originals, plus those originals that are not wider than `size`.
    fn query_for_size(&self, ids: &[AssetId], size: u32) -> Result<Vec<ImageAsset>>;

    fn list_thumbnails(&self, parent_id: AssetId) -> Result<Vec<ImageAsset>>;

    /// Deleting an original also deletes its thumbnails.
    fn delete(&self, id: AssetId) -> Result<bool>;
}

#[allow(clippy::type_complexity)]
fn open_db_and_run_migration(
    support_dir: &str,
    file_name: &str,
    migrations: &[&dyn Fn(&Transaction) -> Result<()>],
) -> Result<Connection> {
    debug!("[asset_db] open and run migration for {}", file_name);
    let mut conn = Connection::open(Path::new(support_dir).join(file_name))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let tx = conn.transaction()?;

    let version = utils::db::init_metadata_and_get_version(&tx)? as usize;
    let target_version = migrations.len();
    debug!(
        "current version = {}, target_version = {}",
        version, target_version
    );
    match version.cmp(&target_version) {
        Ordering::Equal => (),
        Ordering::Less => {
            for (i, f) in migrations.iter().enumerate().skip(version) {
                info!("running migration for version: {}", i + 1);
                f(&tx)?;
            }
            utils::db::set_version_in_metadata(&tx, target_version as i32)?;
        }
        Ordering::Greater => {
            bail!(
                "version too high: current version = {}, target_version = {}",
                version,
                target_version
            );
        }
    }
    tx.commit()?;
    Ok(conn)
}

const SELECT_COLUMNS: &str =
    "SELECT id, bucket, key, size, width, height, request_width, request_height, parent_id FROM image_asset";

fn asset_of_row(row: &Row) -> rusqlite::Result<ImageAsset> {
    let request_width: Option<u32> = row.get(6)?;
    let request_height: Option<u32> = row.get(7)?;
    let parent_id: Option<AssetId> = row.get(8)?;
    // the CHECK constraint keeps these three all set or all null
    let derivation = match (parent_id, request_width, request_height) {
        (Some(parent_id), Some(width), Some(height)) => Some(Derivation {
            parent_id,
            requested: ThumbSize { width, height },
        }),
        _ => None,
    };
    Ok(ImageAsset {
        id: row.get(0)?,
        bucket: row.get(1)?,
        key: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        width: row.get(4)?,
        height: row.get(5)?,
        derivation,
    })
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

pub struct AssetDb {
    conn: Mutex<Connection>,
}

impl AssetDb {
    pub fn open(support_dir: &str) -> Result<AssetDb> {
        let conn = open_db_and_run_migration(
            support_dir,
            "assets.db",
            &[&|tx| {
                let sql = "
                CREATE TABLE image_asset (
                    id             INTEGER PRIMARY KEY AUTOINCREMENT
                                           NOT NULL,
                    bucket         TEXT    NOT NULL,
                    key            TEXT    NOT NULL,
                    size           INTEGER NOT NULL,
                    width          INTEGER NOT NULL,
                    height         INTEGER NOT NULL,
                    request_width  INTEGER,
                    request_height INTEGER,
                    parent_id      INTEGER REFERENCES image_asset (id)
                                           ON DELETE CASCADE,
                    UNIQUE (bucket, key),
                    UNIQUE (parent_id, request_width, request_height),
                    CHECK ((parent_id IS NULL AND request_width IS NULL AND request_height IS NULL)
                        OR (parent_id IS NOT NULL AND request_width IS NOT NULL AND request_height IS NOT NULL))
                );
                CREATE INDEX image_asset_width_index ON image_asset (
                    width
                );
                ";
                for s in sql_split::split(sql) {
                    tx.execute(&s, ())?;
                }
                Ok(())
            }],
        )?;
        Ok(AssetDb {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("asset db lock poisoned"))
    }
}

impl AssetRepository for AssetDb {
    fn get(&self, id: AssetId) -> Result<Option<ImageAsset>> {
        let conn = self.conn()?;
        let mut query = conn.prepare_cached(&format!("{} WHERE id = ?1;", SELECT_COLUMNS))?;
        Ok(query.query_row((id,), asset_of_row).optional()?)
    }

    fn find_thumbnail(&self, parent_id: AssetId, size: ThumbSize) -> Result<Option<ImageAsset>> {
        let conn = self.conn()?;
        let mut query = conn.prepare_cached(&format!(
            "{} WHERE parent_id = ?1 AND request_width = ?2 AND request_height = ?3;",
            SELECT_COLUMNS
        ))?;
        Ok(query
            .query_row((parent_id, size.width, size.height), asset_of_row)
            .optional()?)
    }

    fn insert(&self, asset: NewImageAsset) -> Result<InsertOutcome> {
        let conn = self.conn()?;
        let sql = "INSERT INTO image_asset (bucket, key, size, width, height, request_width, request_height, parent_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);";
        let derivation = asset.derivation;
        let result = conn.prepare_cached(sql)?.execute((
            &asset.bucket,
            &asset.key,
            asset.size as i64,
            asset.width,
            asset.height,
            derivation.map(|x| x.requested.width),
            derivation.map(|x| x.requested.height),
            derivation.map(|x| x.parent_id),
        ));
        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                info!(
                    "[asset_db] recorded image asset id={} key={} parent={:?}",
                    id,
                    asset.key,
                    derivation.map(|x| x.parent_id)
                );
                Ok(InsertOutcome::Inserted(asset.with_id(id)))
            }
            Err(e) if is_unique_violation(&e) => {
                info!(
                    "[asset_db] duplicate image asset key={} parent={:?}",
                    asset.key,
                    derivation.map(|x| x.parent_id)
                );
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn query_for_size(&self, ids: &[AssetId], size: u32) -> Result<Vec<ImageAsset>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = ids.iter().map(|_| "?").join(", ");
        let sql = format!(
            "{} WHERE (parent_id IN ({placeholders}) AND request_width = ? AND request_height = ?) \
             OR (id IN ({placeholders}) AND parent_id IS NULL AND width <= ?);",
            SELECT_COLUMNS
        );
        let size = Value::Integer(size as i64);
        let params = ids
            .iter()
            .map(|id| Value::Integer(*id))
            .chain([size.clone(), size.clone()])
            .chain(ids.iter().map(|id| Value::Integer(*id)))
            .chain([size]);

        let conn = self.conn()?;
        let mut query = conn.prepare(&sql)?;
        let rows = query.query_map(params_from_iter(params), asset_of_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn list_thumbnails(&self, parent_id: AssetId) -> Result<Vec<ImageAsset>> {
        let conn = self.conn()?;
        let mut query = conn.prepare_cached(&format!(
            "{} WHERE parent_id = ?1 ORDER BY id;",
            SELECT_COLUMNS
        ))?;
        let rows = query.query_map((parent_id,), asset_of_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn delete(&self, id: AssetId) -> Result<bool> {
        info!("[asset_db] deleting image asset: id={}", id);
        let changes = self
            .conn()?
            .execute("DELETE FROM image_asset WHERE id = ?1;", (id,))?;
        Ok(changes == 1)
    }
}
