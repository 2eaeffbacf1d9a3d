use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use cadsync_config::{AppConfig, ConfigError};
use cadsync_core::crs::CoordinateReference;
use cadsync_core::model::{DrawingId, JobId, StandardCategory, StandardId};
use cadsync_engine::{
    CadSync, ConversionSettings, ExportOptions, ImportOptions, ImportTarget, Tolerance,
};
use cadsync_store::SqliteStore;
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod cli;

use cli::{Cli, Command, ExportArgs, ImportArgs};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = load_configuration(cli.config.clone());
    init_logging(&config);

    match run(cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "命令执行失败");
            eprintln!("错误: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: &AppConfig) -> Result<()> {
    let database = cli
        .database
        .clone()
        .unwrap_or_else(|| config.storage.database.clone());
    let store = SqliteStore::open(&database)
        .with_context(|| format!("无法打开数据库 {}", database.display()))?;
    let service = CadSync::new(&store);
    info!(database = %database.display(), "cadsync 已启动");

    match cli.command {
        Command::Import(args) => import(&service, config, args),
        Command::Export(args) => export(&service, config, args),
        Command::Job { id } => {
            let job = service.export_job(JobId::new(id))?;
            print_json(&job)
        }
        Command::Drawings => print_json(&service.drawings()?),
        Command::Delete { id } => {
            service.delete_drawing(DrawingId::new(id))?;
            println!("已删除图纸 {id}");
            Ok(())
        }
        Command::Registry { category } => {
            let category = StandardCategory::parse(&category)
                .ok_or_else(|| anyhow!("未知的标准库类别: {category}"))?;
            let rows: Vec<RegistryRow> = service
                .registry(category)?
                .into_iter()
                .map(|(id, entry)| RegistryRow {
                    id,
                    name: entry.name,
                    usage_count: entry.usage_count,
                })
                .collect();
            print_json(&rows)
        }
    }
}

#[derive(Serialize)]
struct RegistryRow {
    id: StandardId,
    name: String,
    usage_count: u64,
}

fn import(service: &CadSync<'_>, config: &AppConfig, args: ImportArgs) -> Result<()> {
    let defaults = &config.import;
    let tolerance = match args.tolerance {
        Some(value) if !(value.is_finite() && value > 0.0) => {
            return Err(anyhow!("--tolerance 必须为正数，当前为 {value}"));
        }
        Some(value) => value,
        None => defaults.tolerance,
    };
    let file = File::open(&args.file)
        .with_context(|| format!("无法打开输入文件 {}", args.file.display()))?;
    let target = match args.drawing {
        Some(id) => ImportTarget::Existing(DrawingId::new(id)),
        None => ImportTarget::new_drawing(args.name.unwrap_or_else(|| drawing_name(&args.file))),
    };
    let options = ImportOptions {
        model_space: defaults.model_space && !args.skip_model_space,
        paper_space: defaults.paper_space && !args.skip_paper_space,
        crs: args
            .crs
            .map(|code| CoordinateReference::tagged(code.clone(), code))
            .unwrap_or_default(),
        conversion: ConversionSettings {
            tolerance: Tolerance::new(tolerance, defaults.relative_tolerance),
            spline_samples: defaults.spline_samples,
        },
        fail_fast: defaults.fail_fast || args.fail_fast,
        register_symbols: defaults.register_symbol_definitions,
        ..ImportOptions::default()
    };

    let mut reader = BufReader::new(file);
    let result = service
        .import(&mut reader, &target, &options)
        .with_context(|| format!("导入 {} 失败", args.file.display()))?;
    for item in &result.errors {
        warn!(
            handle = item.handle.as_deref().unwrap_or("-"),
            entity = %item.entity,
            reason = %item.reason,
            "实体已跳过"
        );
    }
    print_json(&result)
}

fn export(service: &CadSync<'_>, config: &AppConfig, args: ExportArgs) -> Result<()> {
    let defaults = &config.export;
    let version = args.target.unwrap_or_else(|| defaults.version.clone());
    let options = ExportOptions {
        model_space: defaults.model_space && !args.skip_model_space,
        paper_space: defaults.paper_space && !args.skip_paper_space,
        layers: (!args.layers.is_empty()).then_some(args.layers),
        output_dir: args
            .output_dir
            .unwrap_or_else(|| defaults.output_dir.clone()),
        file_name: args.file_name,
        ..ExportOptions::default()
    };
    let result = service
        .export(DrawingId::new(args.drawing), &version, &options)
        .with_context(|| format!("导出图纸 {} 失败", args.drawing))?;
    print_json(&result)
}

fn drawing_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "drawing".to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("序列化输出失败")?;
    println!("{text}");
    Ok(())
}

fn load_configuration(override_path: Option<PathBuf>) -> AppConfig {
    match override_path {
        Some(path) => AppConfig::from_file(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "加载指定配置失败，使用默认配置");
            AppConfig::default()
        }),
        None => match AppConfig::discover() {
            Ok(cfg) => cfg,
            Err(err) => {
                match &err {
                    ConfigError::Io { path, .. }
                    | ConfigError::Parse { path, .. }
                    | ConfigError::Invalid { path, .. } => {
                        warn!(path = %path.display(), error = %err, "加载默认配置失败，使用内建默认值");
                    }
                    ConfigError::Context { .. } => {
                        warn!(error = %err, "加载默认配置失败，使用内建默认值");
                    }
                }
                AppConfig::default()
            }
        },
    }
}

/// 日志写到标准错误，标准输出只留给 JSON 结果。
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(config.logging.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if subscriber.try_init().is_err() {
        // 已初始化，忽略
    }
}
