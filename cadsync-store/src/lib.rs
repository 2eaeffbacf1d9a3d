//! 存储协作方：图纸记录与标准库的事务化读写。
//!
//! 引擎只依赖 [`Store`] 与 [`Transaction`] 两个对象安全的 trait；
//! 仓库内提供内存实现 [`MemoryStore`] 与 SQLite 实现 [`SqliteStore`]，
//! 两者遵守同样的唯一性与事务约定：
//!
//! - 图层按 `(drawing_id, name)` 唯一，标准库条目按 `(category, name)` 唯一，
//!   冲突时返回 [`StoreError::UniqueViolation`]，事务本身仍可继续使用；
//! - 事务内的写入在 [`Transaction::commit`] 之前对其他事务不可见，
//!   未提交即丢弃的事务等同于回滚。

use cadsync_core::model::{
    DimensionAnnotation, DimensionId, Drawing, DrawingCounts, DrawingId, ExportJob, HatchId,
    HatchInstance, JobId, JobStatus, Layer, LayerId, LayoutViewport, PlacementId,
    PrimitiveEntity, PrimitiveId, StandardCategory, StandardEntry, StandardId, SymbolPlacement,
    TextAnnotation, TextId, ViewportId,
};
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {table}: {key}")]
    UniqueViolation { table: &'static str, key: String },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },
    #[error("export job cannot move from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("sqlite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StoreError {
    #[inline]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

/// 存储入口，每次调用开启一个独立事务。
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError>;
}

/// 单个事务内可用的全部读写操作。列表类查询按插入顺序返回。
pub trait Transaction {
    fn insert_drawing(&mut self, drawing: &Drawing) -> Result<DrawingId, StoreError>;
    fn drawing(&mut self, id: DrawingId) -> Result<Option<Drawing>, StoreError>;
    fn update_drawing(&mut self, id: DrawingId, drawing: &Drawing) -> Result<(), StoreError>;
    /// 删除图纸及其全部下属记录；图纸不存在时返回 `false`。
    fn delete_drawing(&mut self, id: DrawingId) -> Result<bool, StoreError>;
    fn drawings(&mut self) -> Result<Vec<(DrawingId, Drawing)>, StoreError>;

    fn find_layer(
        &mut self,
        drawing: DrawingId,
        name: &str,
    ) -> Result<Option<(LayerId, Layer)>, StoreError>;
    fn layer(&mut self, id: LayerId) -> Result<Option<Layer>, StoreError>;
    fn insert_layer(&mut self, layer: &Layer) -> Result<LayerId, StoreError>;
    fn layers(&mut self, drawing: DrawingId) -> Result<Vec<(LayerId, Layer)>, StoreError>;

    /// 查找标准库条目。冲突后的重读必须能看到其他事务已提交的条目。
    fn find_standard(
        &mut self,
        category: StandardCategory,
        name: &str,
    ) -> Result<Option<(StandardId, StandardEntry)>, StoreError>;
    fn standard(&mut self, id: StandardId) -> Result<Option<StandardEntry>, StoreError>;
    fn insert_standard(&mut self, entry: &StandardEntry) -> Result<StandardId, StoreError>;
    fn add_standard_usage(&mut self, id: StandardId, delta: u64) -> Result<(), StoreError>;
    /// 某类别的全部条目，按使用次数降序、名称升序。
    fn standards(
        &mut self,
        category: StandardCategory,
    ) -> Result<Vec<(StandardId, StandardEntry)>, StoreError>;

    fn insert_primitive(&mut self, primitive: &PrimitiveEntity) -> Result<PrimitiveId, StoreError>;
    fn primitives(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(PrimitiveId, PrimitiveEntity)>, StoreError>;
    fn insert_text(&mut self, text: &TextAnnotation) -> Result<TextId, StoreError>;
    fn texts(&mut self, drawing: DrawingId) -> Result<Vec<(TextId, TextAnnotation)>, StoreError>;
    fn insert_dimension(
        &mut self,
        dimension: &DimensionAnnotation,
    ) -> Result<DimensionId, StoreError>;
    fn dimensions(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(DimensionId, DimensionAnnotation)>, StoreError>;
    fn insert_hatch(&mut self, hatch: &HatchInstance) -> Result<HatchId, StoreError>;
    fn hatches(&mut self, drawing: DrawingId) -> Result<Vec<(HatchId, HatchInstance)>, StoreError>;
    fn insert_placement(&mut self, placement: &SymbolPlacement)
    -> Result<PlacementId, StoreError>;
    fn placements(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(PlacementId, SymbolPlacement)>, StoreError>;
    fn insert_viewport(&mut self, viewport: &LayoutViewport) -> Result<ViewportId, StoreError>;
    fn viewports(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(ViewportId, LayoutViewport)>, StoreError>;
    fn counts(&mut self, drawing: DrawingId) -> Result<DrawingCounts, StoreError>;

    fn insert_job(&mut self, job: &ExportJob) -> Result<JobId, StoreError>;
    fn job(&mut self, id: JobId) -> Result<Option<ExportJob>, StoreError>;
    /// 更新任务。状态变化必须满足 [`JobStatus::can_transition_to`]，
    /// 终态任务不再接受任何修改。
    fn update_job(&mut self, id: JobId, job: &ExportJob) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// 两种实现共用的任务状态校验。
pub(crate) fn check_job_update(current: &ExportJob, next: &ExportJob) -> Result<(), StoreError> {
    let unchanged = current.status == next.status;
    if current.status.is_terminal() || (!unchanged && !current.status.can_transition_to(next.status))
    {
        return Err(StoreError::InvalidTransition {
            from: current.status,
            to: next.status,
        });
    }
    Ok(())
}

pub(crate) fn check_layer_owner(
    kind: &'static str,
    drawing: DrawingId,
    layer_id: LayerId,
    layer: Option<&Layer>,
) -> Result<(), StoreError> {
    match layer {
        None => Err(StoreError::NotFound {
            kind: "layer",
            id: layer_id.get(),
        }),
        Some(layer) if layer.drawing_id != drawing => Err(StoreError::Integrity(format!(
            "{kind} of drawing {drawing} references layer {layer_id} of drawing {}",
            layer.drawing_id
        ))),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_jobs_reject_updates() {
        let pending = ExportJob::pending(DrawingId::new(1), "R2018");
        let mut processing = pending.clone();
        processing.status = JobStatus::Processing;
        assert!(check_job_update(&pending, &processing).is_ok());
        assert!(check_job_update(&processing, &processing).is_ok());

        let mut completed = processing.clone();
        completed.status = JobStatus::Completed;
        assert!(check_job_update(&processing, &completed).is_ok());
        assert!(matches!(
            check_job_update(&completed, &completed),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            check_job_update(&pending, &completed),
            Err(StoreError::InvalidTransition { .. })
        ));
    }
}
