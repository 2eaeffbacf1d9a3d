//! 交换格式（DXF）的读取与写出。
//!
//! 读取得到 [`DxfDocument`]，写出时按文档的 [`DxfVersion`] 做版本降级并返回警告。

use std::io::{Read, Write};

use thiserror::Error;
use tracing::{debug, warn};

pub mod model;
mod reader;
pub mod version;
mod writer;

pub use model::*;
pub use version::{DxfVersion, Feature};
pub use writer::WriteReport;

use reader::{DxfError, DxfParser};

#[derive(Debug, Error)]
pub enum IoError {
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("failed to read stream: {source}")]
    Read {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write stream: {source}")]
    Write {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
}

pub trait DocumentLoader {
    fn load(&self, source: &mut dyn Read) -> Result<DxfDocument, IoError>;
}

pub trait DocumentSaver {
    fn save(&self, document: &DxfDocument, target: &mut dyn Write)
    -> Result<WriteReport, IoError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DxfFacade;

impl DxfFacade {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentLoader for DxfFacade {
    fn load(&self, source: &mut dyn Read) -> Result<DxfDocument, IoError> {
        let mut bytes = Vec::new();
        source
            .read_to_end(&mut bytes)
            .map_err(|source| IoError::Read { source })?;
        if bytes.iter().all(|byte| byte.is_ascii_whitespace()) {
            return Err(IoError::InvalidDocument("输入为空".to_string()));
        }
        let (data, lossy) = match String::from_utf8(bytes) {
            Ok(text) => (text, false),
            Err(err) => (String::from_utf8_lossy(err.as_bytes()).into_owned(), true),
        };
        let mut document = DxfParser::new(&data).parse().map_err(|err| match err {
            DxfError::Unsupported { feature } => IoError::UnsupportedFeature(feature),
            DxfError::Invalid { message } => IoError::InvalidDocument(message),
        })?;
        if lossy {
            warn!("输入不是有效的 UTF-8，无法解码的字符已替换");
            document
                .warnings
                .push("输入不是有效的 UTF-8，无法解码的字符已替换".to_string());
        }
        debug!(
            version = %document.version,
            entities = document.entities.len(),
            blocks = document.blocks.len(),
            skipped = document.skipped.len(),
            "交换文件解析完成"
        );
        Ok(document)
    }
}

impl DocumentSaver for DxfFacade {
    fn save(
        &self,
        document: &DxfDocument,
        target: &mut dyn Write,
    ) -> Result<WriteReport, IoError> {
        writer::write_document(document, target)
    }
}
