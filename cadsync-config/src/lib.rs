use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// 配置文件路径的环境变量。
pub const CONFIG_ENV: &str = "CADSYNC_CONFIG";

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate(path)?;
        Ok(config)
    }

    /// 自动发现配置文件：优先读取环境变量 `CADSYNC_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let import = &self.import;
        let invalid = |message: String| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        };
        if !(import.tolerance.is_finite() && import.tolerance > 0.0) {
            return Err(invalid(format!(
                "import.tolerance 必须为正数，当前为 {}",
                import.tolerance
            )));
        }
        if !(import.relative_tolerance.is_finite() && import.relative_tolerance > 0.0) {
            return Err(invalid(format!(
                "import.relative_tolerance 必须为正数，当前为 {}",
                import.relative_tolerance
            )));
        }
        if import.spline_samples < 2 {
            return Err(invalid(format!(
                "import.spline_samples 至少为 2，当前为 {}",
                import.spline_samples
            )));
        }
        Ok(())
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite 数据库文件。
    #[serde(default = "StorageConfig::default_database")]
    pub database: PathBuf,
}

impl StorageConfig {
    fn default_database() -> PathBuf {
        PathBuf::from("cadsync.db")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: Self::default_database(),
        }
    }
}

const fn enabled() -> bool {
    true
}

/// 导入默认值。容差单位与图纸单位一致。
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "ImportConfig::default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "ImportConfig::default_relative_tolerance")]
    pub relative_tolerance: f64,
    #[serde(default = "ImportConfig::default_spline_samples")]
    pub spline_samples: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "enabled")]
    pub model_space: bool,
    #[serde(default = "enabled")]
    pub paper_space: bool,
    #[serde(default = "enabled")]
    pub register_symbol_definitions: bool,
}

impl ImportConfig {
    fn default_tolerance() -> f64 {
        0.01
    }

    fn default_relative_tolerance() -> f64 {
        0.001
    }

    fn default_spline_samples() -> usize {
        64
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            tolerance: Self::default_tolerance(),
            relative_tolerance: Self::default_relative_tolerance(),
            spline_samples: Self::default_spline_samples(),
            fail_fast: false,
            model_space: true,
            paper_space: true,
            register_symbol_definitions: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "ExportConfig::default_output_dir")]
    pub output_dir: PathBuf,
    /// 目标版本，接受 `R2018`、`2018` 或 `AC1032`。
    #[serde(default = "ExportConfig::default_version")]
    pub version: String,
    #[serde(default = "enabled")]
    pub model_space: bool,
    #[serde(default = "enabled")]
    pub paper_space: bool,
}

impl ExportConfig {
    fn default_output_dir() -> PathBuf {
        PathBuf::from("exports")
    }

    fn default_version() -> String {
        "R2018".to_string()
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: Self::default_output_dir(),
            version: Self::default_version(),
            model_space: true,
            paper_space: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("配置文件 {path:?} 无效: {message}")]
    Invalid { path: PathBuf, message: String },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_every_section() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.storage.database, PathBuf::from("cadsync.db"));
        assert!((cfg.import.tolerance - 0.01).abs() < f64::EPSILON);
        assert_eq!(cfg.import.spline_samples, 64);
        assert!(!cfg.import.fail_fast);
        assert!(cfg.import.register_symbol_definitions);
        assert_eq!(cfg.export.version, "R2018");
        assert_eq!(cfg.export.output_dir, PathBuf::from("exports"));
    }

    #[test]
    fn load_from_temp_file() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(
            file,
            r#"
            [logging]
            level = "debug"

            [storage]
            database = "/var/lib/cadsync/registry.db"

            [import]
            tolerance = 0.05
            fail_fast = true
            paper_space = false

            [export]
            output_dir = "out"
            version = "R12"
            "#
        )
        .expect("write temp file");

        let cfg = AppConfig::from_file(file.path()).expect("load config");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(
            cfg.storage.database,
            PathBuf::from("/var/lib/cadsync/registry.db")
        );
        assert!((cfg.import.tolerance - 0.05).abs() < f64::EPSILON);
        assert!((cfg.import.relative_tolerance - 0.001).abs() < f64::EPSILON);
        assert!(cfg.import.fail_fast);
        assert!(cfg.import.model_space);
        assert!(!cfg.import.paper_space);
        assert_eq!(cfg.export.output_dir, PathBuf::from("out"));
        assert_eq!(cfg.export.version, "R12");
        assert!(cfg.export.paper_space);
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[logging]\nlevel = \"warn\"").expect("write temp file");
        let cfg = AppConfig::from_file(file.path()).expect("load config");
        assert_eq!(cfg.logging.level, "warn");
        assert_eq!(cfg.export.version, "R2018");
        assert_eq!(cfg.import.spline_samples, 64);
    }

    #[test]
    fn rejects_non_positive_tolerance() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[import]\ntolerance = 0.0").expect("write temp file");
        let err = AppConfig::from_file(file.path()).expect_err("tolerance 0 应当被拒绝");
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err:?}");
    }

    #[test]
    fn malformed_toml_reports_path() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[import\ntolerance = ").expect("write temp file");
        let err = AppConfig::from_file(file.path()).expect_err("非法 TOML 应当失败");
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().starts_with("解析配置文件"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let err = AppConfig::from_file(dir.path().join("absent.toml"))
            .expect_err("缺失文件应当失败");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
