use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use cadsync_core::model::{
    DimensionAnnotation, DimensionId, Drawing, DrawingCounts, DrawingId, ExportJob, HatchId,
    HatchInstance, JobId, Layer, LayerId, LayoutViewport, PlacementId, PrimitiveEntity,
    PrimitiveId, StandardCategory, StandardEntry, StandardId, SymbolPlacement, TextAnnotation,
    TextId, ViewportId,
};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::{StoreError, Store, Transaction, check_job_update, check_layer_owner};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS drawings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS layers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    drawing_id INTEGER NOT NULL REFERENCES drawings(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    body TEXT NOT NULL,
    UNIQUE (drawing_id, name)
);
CREATE TABLE IF NOT EXISTS standards (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    name TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL,
    UNIQUE (category, name)
);
CREATE TABLE IF NOT EXISTS primitives (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    drawing_id INTEGER NOT NULL REFERENCES drawings(id) ON DELETE CASCADE,
    layer_id INTEGER REFERENCES layers(id) ON DELETE CASCADE,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS texts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    drawing_id INTEGER NOT NULL REFERENCES drawings(id) ON DELETE CASCADE,
    layer_id INTEGER REFERENCES layers(id) ON DELETE CASCADE,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS dimensions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    drawing_id INTEGER NOT NULL REFERENCES drawings(id) ON DELETE CASCADE,
    layer_id INTEGER REFERENCES layers(id) ON DELETE CASCADE,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS hatches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    drawing_id INTEGER NOT NULL REFERENCES drawings(id) ON DELETE CASCADE,
    layer_id INTEGER REFERENCES layers(id) ON DELETE CASCADE,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS placements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    drawing_id INTEGER NOT NULL REFERENCES drawings(id) ON DELETE CASCADE,
    layer_id INTEGER REFERENCES layers(id) ON DELETE CASCADE,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS viewports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    drawing_id INTEGER NOT NULL REFERENCES drawings(id) ON DELETE CASCADE,
    layer_id INTEGER,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS export_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    drawing_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    body TEXT NOT NULL
);
"#;

/// 子表名称，全部带有 `drawing_id`、`layer_id` 与 JSON `body` 三列。
const CHILD_TABLES: [&str; 6] = [
    "primitives",
    "texts",
    "dimensions",
    "hatches",
    "placements",
    "viewports",
];

/// SQLite 持久化存储。几何与属性以 JSON 保存在 `body` 列，
/// 唯一性约束交由数据库保证。
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并确保表结构存在。
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "打开 SQLite 存储");
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Store for SqliteStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))?;
        // 立即获取写锁，避免两个事务先读后写时升级失败
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction { conn, open: true }))
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    open: bool,
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "回滚未完成的 SQLite 事务失败");
            }
        }
    }
}

#[inline]
fn to_key(raw: u64) -> i64 {
    raw as i64
}

#[inline]
fn from_key(raw: i64) -> u64 {
    raw as u64
}

/// 唯一约束冲突映射为 [`StoreError::UniqueViolation`]，其余原样保留。
fn classify(err: rusqlite::Error, table: &'static str, key: impl FnOnce() -> String) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            StoreError::UniqueViolation { table, key: key() }
        }
        _ => StoreError::Sqlite(err),
    }
}

impl SqliteTransaction<'_> {
    fn require_drawing(&self, id: DrawingId) -> Result<(), StoreError> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM drawings WHERE id = ?1",
                params![to_key(id.get())],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                kind: "drawing",
                id: id.get(),
            }),
        }
    }

    fn insert_child<T: Serialize>(
        &mut self,
        table: &'static str,
        kind: &'static str,
        drawing: DrawingId,
        layer: Option<LayerId>,
        record: &T,
    ) -> Result<u64, StoreError> {
        self.require_drawing(drawing)?;
        if let Some(layer_id) = layer {
            let owner = self.layer(layer_id)?;
            check_layer_owner(kind, drawing, layer_id, owner.as_ref())?;
        }
        let body = serde_json::to_string(record)?;
        self.conn.execute(
            &format!("INSERT INTO {table} (drawing_id, layer_id, body) VALUES (?1, ?2, ?3)"),
            params![
                to_key(drawing.get()),
                layer.map(|id| to_key(id.get())),
                body
            ],
        )?;
        Ok(from_key(self.conn.last_insert_rowid()))
    }

    fn list_children<T: DeserializeOwned>(
        &self,
        table: &'static str,
        drawing: DrawingId,
    ) -> Result<Vec<(u64, T)>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, body FROM {table} WHERE drawing_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![to_key(drawing.get())], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (id, body) = row?;
            records.push((from_key(id), serde_json::from_str(&body)?));
        }
        Ok(records)
    }

    fn count(&self, table: &'static str, drawing: DrawingId) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE drawing_id = ?1"),
            params![to_key(drawing.get())],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn decode_standard(body: &str, usage_count: i64) -> Result<StandardEntry, StoreError> {
        let mut entry: StandardEntry = serde_json::from_str(body)?;
        entry.usage_count = u64::try_from(usage_count).unwrap_or(0);
        Ok(entry)
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn insert_drawing(&mut self, drawing: &Drawing) -> Result<DrawingId, StoreError> {
        let body = serde_json::to_string(drawing)?;
        self.conn.execute(
            "INSERT INTO drawings (name, body) VALUES (?1, ?2)",
            params![drawing.name, body],
        )?;
        Ok(DrawingId::new(from_key(self.conn.last_insert_rowid())))
    }

    fn drawing(&mut self, id: DrawingId) -> Result<Option<Drawing>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM drawings WHERE id = ?1",
                params![to_key(id.get())],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| serde_json::from_str(&body).map_err(StoreError::from))
            .transpose()
    }

    fn update_drawing(&mut self, id: DrawingId, drawing: &Drawing) -> Result<(), StoreError> {
        let body = serde_json::to_string(drawing)?;
        let changed = self.conn.execute(
            "UPDATE drawings SET name = ?1, body = ?2 WHERE id = ?3",
            params![drawing.name, body, to_key(id.get())],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "drawing",
                id: id.get(),
            });
        }
        Ok(())
    }

    fn delete_drawing(&mut self, id: DrawingId) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "DELETE FROM drawings WHERE id = ?1",
            params![to_key(id.get())],
        )?;
        debug!(drawing = %id, deleted = changed > 0, "删除图纸");
        Ok(changed > 0)
    }

    fn drawings(&mut self) -> Result<Vec<(DrawingId, Drawing)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM drawings ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut drawings = Vec::new();
        for row in rows {
            let (id, body) = row?;
            drawings.push((DrawingId::new(from_key(id)), serde_json::from_str(&body)?));
        }
        Ok(drawings)
    }

    fn find_layer(
        &mut self,
        drawing: DrawingId,
        name: &str,
    ) -> Result<Option<(LayerId, Layer)>, StoreError> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, body FROM layers WHERE drawing_id = ?1 AND name = ?2",
                params![to_key(drawing.get()), name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((id, body)) => Ok(Some((
                LayerId::new(from_key(id)),
                serde_json::from_str(&body)?,
            ))),
            None => Ok(None),
        }
    }

    fn layer(&mut self, id: LayerId) -> Result<Option<Layer>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM layers WHERE id = ?1",
                params![to_key(id.get())],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| serde_json::from_str(&body).map_err(StoreError::from))
            .transpose()
    }

    fn insert_layer(&mut self, layer: &Layer) -> Result<LayerId, StoreError> {
        self.require_drawing(layer.drawing_id)?;
        let body = serde_json::to_string(layer)?;
        self.conn
            .execute(
                "INSERT INTO layers (drawing_id, name, body) VALUES (?1, ?2, ?3)",
                params![to_key(layer.drawing_id.get()), layer.name, body],
            )
            .map_err(|err| {
                classify(err, "layers", || {
                    format!("({}, {})", layer.drawing_id, layer.name)
                })
            })?;
        Ok(LayerId::new(from_key(self.conn.last_insert_rowid())))
    }

    fn layers(&mut self, drawing: DrawingId) -> Result<Vec<(LayerId, Layer)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM layers WHERE drawing_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![to_key(drawing.get())], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut layers = Vec::new();
        for row in rows {
            let (id, body) = row?;
            layers.push((LayerId::new(from_key(id)), serde_json::from_str(&body)?));
        }
        Ok(layers)
    }

    fn find_standard(
        &mut self,
        category: StandardCategory,
        name: &str,
    ) -> Result<Option<(StandardId, StandardEntry)>, StoreError> {
        let row: Option<(i64, String, i64)> = self
            .conn
            .query_row(
                "SELECT id, body, usage_count FROM standards WHERE category = ?1 AND name = ?2",
                params![category.as_str(), name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            Some((id, body, usage)) => Ok(Some((
                StandardId::new(from_key(id)),
                Self::decode_standard(&body, usage)?,
            ))),
            None => Ok(None),
        }
    }

    fn standard(&mut self, id: StandardId) -> Result<Option<StandardEntry>, StoreError> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT body, usage_count FROM standards WHERE id = ?1",
                params![to_key(id.get())],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(body, usage)| Self::decode_standard(&body, usage))
            .transpose()
    }

    fn insert_standard(&mut self, entry: &StandardEntry) -> Result<StandardId, StoreError> {
        let body = serde_json::to_string(entry)?;
        let category = entry.category();
        self.conn
            .execute(
                "INSERT INTO standards (category, name, usage_count, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    category.as_str(),
                    entry.name,
                    i64::try_from(entry.usage_count).unwrap_or(i64::MAX),
                    body
                ],
            )
            .map_err(|err| classify(err, "standards", || format!("({category}, {})", entry.name)))?;
        Ok(StandardId::new(from_key(self.conn.last_insert_rowid())))
    }

    fn add_standard_usage(&mut self, id: StandardId, delta: u64) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE standards SET usage_count = usage_count + ?1 WHERE id = ?2",
            params![i64::try_from(delta).unwrap_or(i64::MAX), to_key(id.get())],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "standard",
                id: id.get(),
            });
        }
        Ok(())
    }

    fn standards(
        &mut self,
        category: StandardCategory,
    ) -> Result<Vec<(StandardId, StandardEntry)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, body, usage_count FROM standards WHERE category = ?1 \
             ORDER BY usage_count DESC, name ASC",
        )?;
        let rows = stmt.query_map(params![category.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, body, usage) = row?;
            entries.push((
                StandardId::new(from_key(id)),
                Self::decode_standard(&body, usage)?,
            ));
        }
        Ok(entries)
    }

    fn insert_primitive(&mut self, primitive: &PrimitiveEntity) -> Result<PrimitiveId, StoreError> {
        self.insert_child(
            "primitives",
            "primitive",
            primitive.drawing_id,
            Some(primitive.layer_id),
            primitive,
        )
        .map(PrimitiveId::new)
    }

    fn primitives(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(PrimitiveId, PrimitiveEntity)>, StoreError> {
        Ok(self
            .list_children("primitives", drawing)?
            .into_iter()
            .map(|(id, record)| (PrimitiveId::new(id), record))
            .collect())
    }

    fn insert_text(&mut self, text: &TextAnnotation) -> Result<TextId, StoreError> {
        self.insert_child("texts", "text", text.drawing_id, Some(text.layer_id), text)
            .map(TextId::new)
    }

    fn texts(&mut self, drawing: DrawingId) -> Result<Vec<(TextId, TextAnnotation)>, StoreError> {
        Ok(self
            .list_children("texts", drawing)?
            .into_iter()
            .map(|(id, record)| (TextId::new(id), record))
            .collect())
    }

    fn insert_dimension(
        &mut self,
        dimension: &DimensionAnnotation,
    ) -> Result<DimensionId, StoreError> {
        self.insert_child(
            "dimensions",
            "dimension",
            dimension.drawing_id,
            Some(dimension.layer_id),
            dimension,
        )
        .map(DimensionId::new)
    }

    fn dimensions(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(DimensionId, DimensionAnnotation)>, StoreError> {
        Ok(self
            .list_children("dimensions", drawing)?
            .into_iter()
            .map(|(id, record)| (DimensionId::new(id), record))
            .collect())
    }

    fn insert_hatch(&mut self, hatch: &HatchInstance) -> Result<HatchId, StoreError> {
        self.insert_child("hatches", "hatch", hatch.drawing_id, Some(hatch.layer_id), hatch)
            .map(HatchId::new)
    }

    fn hatches(&mut self, drawing: DrawingId) -> Result<Vec<(HatchId, HatchInstance)>, StoreError> {
        Ok(self
            .list_children("hatches", drawing)?
            .into_iter()
            .map(|(id, record)| (HatchId::new(id), record))
            .collect())
    }

    fn insert_placement(
        &mut self,
        placement: &SymbolPlacement,
    ) -> Result<PlacementId, StoreError> {
        self.insert_child(
            "placements",
            "placement",
            placement.drawing_id,
            placement.layer_id,
            placement,
        )
        .map(PlacementId::new)
    }

    fn placements(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(PlacementId, SymbolPlacement)>, StoreError> {
        Ok(self
            .list_children("placements", drawing)?
            .into_iter()
            .map(|(id, record)| (PlacementId::new(id), record))
            .collect())
    }

    fn insert_viewport(&mut self, viewport: &LayoutViewport) -> Result<ViewportId, StoreError> {
        self.insert_child("viewports", "viewport", viewport.drawing_id, None, viewport)
            .map(ViewportId::new)
    }

    fn viewports(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(ViewportId, LayoutViewport)>, StoreError> {
        Ok(self
            .list_children("viewports", drawing)?
            .into_iter()
            .map(|(id, record)| (ViewportId::new(id), record))
            .collect())
    }

    fn counts(&mut self, drawing: DrawingId) -> Result<DrawingCounts, StoreError> {
        let [primitives, text, dimensions, hatches, placements, viewports] = CHILD_TABLES;
        Ok(DrawingCounts {
            layers: self.count("layers", drawing)?,
            primitives: self.count(primitives, drawing)?,
            text: self.count(text, drawing)?,
            dimensions: self.count(dimensions, drawing)?,
            hatches: self.count(hatches, drawing)?,
            placements: self.count(placements, drawing)?,
            viewports: self.count(viewports, drawing)?,
        })
    }

    fn insert_job(&mut self, job: &ExportJob) -> Result<JobId, StoreError> {
        let body = serde_json::to_string(job)?;
        self.conn.execute(
            "INSERT INTO export_jobs (drawing_id, status, body) VALUES (?1, ?2, ?3)",
            params![to_key(job.drawing_id.get()), job.status.as_str(), body],
        )?;
        Ok(JobId::new(from_key(self.conn.last_insert_rowid())))
    }

    fn job(&mut self, id: JobId) -> Result<Option<ExportJob>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM export_jobs WHERE id = ?1",
                params![to_key(id.get())],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| serde_json::from_str(&body).map_err(StoreError::from))
            .transpose()
    }

    fn update_job(&mut self, id: JobId, job: &ExportJob) -> Result<(), StoreError> {
        let current = self.job(id)?.ok_or(StoreError::NotFound {
            kind: "export job",
            id: id.get(),
        })?;
        check_job_update(&current, job)?;
        let body = serde_json::to_string(job)?;
        self.conn.execute(
            "UPDATE export_jobs SET status = ?1, body = ?2 WHERE id = ?3",
            params![job.status.as_str(), body, to_key(id.get())],
        )?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.open = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
