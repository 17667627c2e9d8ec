use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use serde::Serialize;

use crate::Opts;
use crate::checkpoint::{write_bytes_atomic, write_npy_atomic};
use crate::cli::{SubCommandExtend, open_descriptor, scan_media};
use crate::config::{ExtractorOptions, ParallelOptions, TypeOptions};
use crate::model::ModelParams;

#[derive(Parser, Debug, Clone)]
pub struct ExtractCommand {
    #[command(flatten)]
    pub ty: TypeOptions,
    #[command(flatten)]
    pub parallel: ParallelOptions,
    #[command(flatten)]
    pub extractor: ExtractorOptions,
    /// 图片或视频所在目录
    pub path: PathBuf,
    /// 输出目录
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub output: PathBuf,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long)]
    pub suffix: Option<String>,
    /// 合并后的描述符总行数，默认图片 1000000 行，视频 1500000 行
    #[arg(short, long, value_name = "ROWS")]
    pub limit: Option<usize>,
    /// 下采样使用的随机种子
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Serialize)]
struct Entry<'a> {
    hash: &'a str,
    rows: usize,
}

impl SubCommandExtend for ExtractCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let dtype = self.ty.descriptor_type();
        let mut params = ModelParams::default();
        params.kmeans.seed = self.seed;
        let descriptor = open_descriptor(opts, dtype, params, &self.parallel, &self.extractor)?;

        let items = scan_media(&self.path, dtype, self.suffix.as_deref())?;
        let matrix = descriptor.generate_matrix(&items, self.limit)?;

        std::fs::create_dir_all(&self.output)?;
        let name = format!("{}.{}", dtype.modality, dtype.kind);
        let info_path = self.output.join(format!("{name}.info.npy"));
        let descriptors_path = self.output.join(format!("{name}.descriptors.npy"));
        write_npy_atomic(&info_path, &matrix.info)?;
        write_npy_atomic(&descriptors_path, &matrix.descriptors)?;

        let entries: Vec<Entry> = matrix.items.iter().map(|(hash, rows)| Entry { hash, rows: *rows }).collect();
        let listing = self.output.join(format!("{name}.items.json"));
        write_bytes_atomic(&listing, serde_json::to_string_pretty(&entries)?.as_bytes())?;

        info!("{} 行描述符已保存到 {}", matrix.rows(), descriptors_path.display());
        Ok(())
    }
}
