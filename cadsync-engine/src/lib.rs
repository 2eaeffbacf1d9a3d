//! 入库/导出引擎：几何转换、名称解析、导入器、导出器与对宿主的服务入口。

pub mod convert;
pub mod export;
pub mod import;
pub mod resolve;
pub mod service;

pub use convert::{ConversionSettings, Tolerance};
pub use export::{ExportOptions, ExportPhase, ExportResult, Exporter};
pub use import::{
    CancelFlag, ImportCounts, ImportOptions, ImportPhase, ImportResult, ImportTarget, Importer,
    ItemError,
};
pub use resolve::{NameResolver, ResolverStats};
pub use service::{CadSync, DrawingSummary};

pub mod errors {
    use std::path::PathBuf;

    use cadsync_core::crs::CoordinateReference;
    use cadsync_core::model::{DrawingId, JobId};
    use cadsync_io::IoError;
    use cadsync_store::StoreError;
    use thiserror::Error;

    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum GeometryError {
        #[error("closed ring needs at least 3 distinct points, found {distinct}")]
        TooFewRingPoints { distinct: usize },
        #[error("degenerate {kind}: {reason}")]
        Degenerate { kind: &'static str, reason: String },
        #[error("non-finite coordinate in {kind}")]
        NonFinite { kind: &'static str },
        #[error("{0} is not a drawing primitive")]
        NotAPrimitive(&'static str),
        #[error("chord tolerance must be positive, got {0}")]
        InvalidTolerance(f64),
        #[error(
            "radius {radius} needs more than {limit} segments to stay within tolerance {tolerance}"
        )]
        TooManySegments {
            radius: f64,
            tolerance: f64,
            limit: usize,
        },
    }

    #[derive(Debug, Error)]
    pub enum ImportError {
        #[error("failed to decode interchange file: {0}")]
        Format(#[source] IoError),
        #[error("drawing {0} not found")]
        DrawingNotFound(DrawingId),
        #[error("coordinate reference {requested} does not match drawing {drawing} ({existing})")]
        CrsMismatch {
            drawing: DrawingId,
            existing: CoordinateReference,
            requested: CoordinateReference,
        },
        #[error("{entity} {handle} rejected: {source}")]
        Geometry {
            entity: String,
            handle: String,
            #[source]
            source: GeometryError,
        },
        #[error("storage failure during import: {0}")]
        Storage(#[from] StoreError),
        #[error("import cancelled")]
        Cancelled,
    }

    #[derive(Debug, Error)]
    pub enum ExportError {
        #[error("drawing {0} not found")]
        DrawingNotFound(DrawingId),
        #[error("unsupported target version: {0}")]
        UnsupportedVersion(String),
        #[error("{what} cannot be represented: {source}")]
        Geometry {
            what: String,
            #[source]
            source: GeometryError,
        },
        #[error("failed to serialize interchange file: {0}")]
        Write(#[source] IoError),
        #[error("failed to write output {path:?}: {source}")]
        Output {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("storage failure during export: {0}")]
        Storage(#[from] StoreError),
        #[error("cancelled")]
        Cancelled,
        #[error("export job {job} failed: {source}")]
        JobFailed {
            job: JobId,
            #[source]
            source: Box<ExportError>,
        },
    }

    impl ExportError {
        /// 失败已记录到任务时返回任务标识。
        pub fn job_id(&self) -> Option<JobId> {
            match self {
                ExportError::JobFailed { job, .. } => Some(*job),
                _ => None,
            }
        }
    }

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error(transparent)]
        Import(#[from] ImportError),
        #[error(transparent)]
        Export(#[from] ExportError),
        #[error(transparent)]
        Storage(#[from] StoreError),
        #[error("drawing {0} not found")]
        DrawingNotFound(DrawingId),
        #[error("export job {0} not found")]
        JobNotFound(JobId),
    }
}
