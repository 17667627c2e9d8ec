use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::Opts;
use crate::cli::{SubCommandExtend, open_descriptor, scan_media};
use crate::config::{ExtractorOptions, ModelOptions, ParallelOptions, TypeOptions};
use crate::model::BuildOutcome;

#[derive(Parser, Debug, Clone)]
pub struct TrainCommand {
    #[command(flatten)]
    pub ty: TypeOptions,
    #[command(flatten)]
    pub model: ModelOptions,
    #[command(flatten)]
    pub parallel: ParallelOptions,
    #[command(flatten)]
    pub extractor: ExtractorOptions,
    /// 用于训练的图片或视频所在目录
    pub path: PathBuf,
    /// 扫描的文件后缀名，多个后缀用逗号分隔，不指定时按内容类型过滤
    #[arg(short, long)]
    pub suffix: Option<String>,
    /// 用于聚类的描述符总行数，默认图片 1000000 行，视频 1500000 行
    #[arg(short, long, value_name = "ROWS")]
    pub limit: Option<usize>,
}

impl SubCommandExtend for TrainCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let dtype = self.ty.descriptor_type();
        let descriptor = open_descriptor(opts, dtype, (&self.model).into(), &self.parallel, &self.extractor)?;
        if descriptor.has_model() {
            info!("{dtype} 模型已存在，跳过训练");
            return Ok(());
        }

        let items = scan_media(&self.path, dtype, self.suffix.as_deref())?;
        match descriptor.generate_model(&items, self.limit)? {
            BuildOutcome::Existing => info!("{dtype} 模型已存在"),
            BuildOutcome::Built(params) => {
                info!("{dtype} 训练完成");
                println!("{}", serde_json::to_string_pretty(&params)?);
            }
        }
        Ok(())
    }
}
