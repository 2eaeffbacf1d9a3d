//! 面向宿主的入口：导入、导出、任务查询与图纸管理。

use std::io::Read;

use cadsync_core::model::{
    Drawing, DrawingCounts, DrawingId, ExportJob, JobId, JobStatus, StandardCategory,
    StandardEntry, StandardId,
};
use cadsync_store::Store;
use serde::Serialize;
use tracing::info;

use crate::errors::EngineError;
use crate::export::{ExportOptions, ExportResult, Exporter};
use crate::import::{ImportOptions, ImportResult, ImportTarget, Importer};

/// 图纸及其下属记录数量。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawingSummary {
    pub id: DrawingId,
    pub drawing: Drawing,
    pub counts: DrawingCounts,
}

/// 对存储的一层薄封装；每次调用都是独立的同步操作。
#[derive(Clone, Copy)]
pub struct CadSync<'s> {
    store: &'s dyn Store,
}

impl<'s> CadSync<'s> {
    pub fn new(store: &'s dyn Store) -> Self {
        Self { store }
    }

    #[inline]
    pub fn store(&self) -> &'s dyn Store {
        self.store
    }

    pub fn import(
        &self,
        source: &mut dyn Read,
        target: &ImportTarget,
        options: &ImportOptions,
    ) -> Result<ImportResult, EngineError> {
        Ok(Importer::new(self.store).run(source, target, options)?)
    }

    pub fn export(
        &self,
        drawing: DrawingId,
        version: &str,
        options: &ExportOptions,
    ) -> Result<ExportResult, EngineError> {
        Ok(Exporter::new(self.store).export(drawing, version, options)?)
    }

    pub fn export_job(&self, id: JobId) -> Result<ExportJob, EngineError> {
        let mut tx = self.store.begin()?;
        let job = tx.job(id)?;
        tx.rollback()?;
        job.ok_or(EngineError::JobNotFound(id))
    }

    pub fn export_job_status(&self, id: JobId) -> Result<JobStatus, EngineError> {
        self.export_job(id).map(|job| job.status)
    }

    pub fn create_drawing(&self, drawing: &Drawing) -> Result<DrawingId, EngineError> {
        let mut tx = self.store.begin()?;
        let id = tx.insert_drawing(drawing)?;
        tx.commit()?;
        info!(drawing = %id, name = %drawing.name, "图纸已创建");
        Ok(id)
    }

    pub fn drawing(&self, id: DrawingId) -> Result<DrawingSummary, EngineError> {
        let mut tx = self.store.begin()?;
        let drawing = tx.drawing(id)?;
        let summary = match drawing {
            Some(drawing) => Some(DrawingSummary {
                id,
                counts: tx.counts(id)?,
                drawing,
            }),
            None => None,
        };
        tx.rollback()?;
        summary.ok_or(EngineError::DrawingNotFound(id))
    }

    pub fn drawings(&self) -> Result<Vec<DrawingSummary>, EngineError> {
        let mut tx = self.store.begin()?;
        let mut summaries = Vec::new();
        for (id, drawing) in tx.drawings()? {
            summaries.push(DrawingSummary {
                id,
                counts: tx.counts(id)?,
                drawing,
            });
        }
        tx.rollback()?;
        Ok(summaries)
    }

    /// 级联删除图纸及其全部记录；标准库条目保留。
    pub fn delete_drawing(&self, id: DrawingId) -> Result<(), EngineError> {
        let mut tx = self.store.begin()?;
        if !tx.delete_drawing(id)? {
            tx.rollback()?;
            return Err(EngineError::DrawingNotFound(id));
        }
        tx.commit()?;
        info!(drawing = %id, "图纸已删除");
        Ok(())
    }

    /// 某类别的标准库条目，按使用次数降序。
    pub fn registry(
        &self,
        category: StandardCategory,
    ) -> Result<Vec<(StandardId, StandardEntry)>, EngineError> {
        let mut tx = self.store.begin()?;
        let entries = tx.standards(category)?;
        tx.rollback()?;
        Ok(entries)
    }
}
