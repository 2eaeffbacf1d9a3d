use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// CAD 交换文件与空间数据库之间的导入导出工具。
#[derive(Debug, Parser)]
#[command(name = "cadsync", author, version, about, long_about = None)]
pub struct Cli {
    /// 配置文件路径；缺省时读取 `CADSYNC_CONFIG` 或 `./config/default.toml`。
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// 覆盖配置中的数据库路径。
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// 导入交换文件
    Import(ImportArgs),
    /// 导出图纸并登记导出任务
    Export(ExportArgs),
    /// 查询导出任务
    Job {
        id: u64,
    },
    /// 列出图纸及记录数量
    Drawings,
    /// 删除图纸及其全部记录
    Delete {
        id: u64,
    },
    /// 按使用次数列出标准库条目
    Registry {
        /// layer、line_style、text_style、fill_pattern、dimension_style 或 symbol
        category: String,
    },
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    pub file: PathBuf,
    /// 导入到已有图纸
    #[arg(long, conflicts_with = "name")]
    pub drawing: Option<u64>,
    /// 新图纸名称，缺省取文件名
    #[arg(long)]
    pub name: Option<String>,
    /// 坐标参考标签，例如 `EPSG:2230`
    #[arg(long)]
    pub crs: Option<String>,
    /// 单个实体出错即中止
    #[arg(long)]
    pub fail_fast: bool,
    /// 覆盖配置中的弦高容差
    #[arg(long)]
    pub tolerance: Option<f64>,
    #[arg(long)]
    pub skip_model_space: bool,
    #[arg(long)]
    pub skip_paper_space: bool,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    pub drawing: u64,
    /// 目标版本，缺省取配置
    #[arg(long)]
    pub target: Option<String>,
    /// 图层白名单，逗号分隔
    #[arg(long, value_delimiter = ',')]
    pub layers: Vec<String>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long)]
    pub file_name: Option<String>,
    #[arg(long)]
    pub skip_model_space: bool,
    #[arg(long)]
    pub skip_paper_space: bool,
}
