mod extract;
mod kinds;
mod quantize;
mod train;

use std::path::{Path, PathBuf};

pub use extract::*;
use indicatif::{ParallelProgressIterator, ProgressBar};
pub use kinds::*;
use log::{info, warn};
pub use quantize::*;
use rayon::prelude::*;
use regex::Regex;
pub use train::*;
use walkdir::WalkDir;

use crate::config::{ExtractorOptions, Opts, ParallelOptions};
use crate::descriptor::{ColorDescriptor, ColorDescriptorBuilder};
use crate::media::{MediaItem, guess_content_type};
use crate::model::ModelParams;
use crate::registry::DescriptorType;
use crate::utils::pb_style;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> anyhow::Result<()>;
}

/// 按命令行参数打开一个描述符类型
pub(crate) fn open_descriptor(
    opts: &Opts,
    dtype: DescriptorType,
    model: ModelParams,
    parallel: &ParallelOptions,
    extractor: &ExtractorOptions,
) -> anyhow::Result<ColorDescriptor> {
    let temp = opts.dirs().temp();
    let descriptor = ColorDescriptorBuilder::new(dtype, &opts.model_dir, &opts.work_dir)
        .extractor(extractor.extractor(&temp))
        .sampler(extractor.sampler(&temp))
        .model_params(model)
        .parallel(parallel.parallel, parallel.copy_parallel)
        .row_limit(extractor.row_limit)
        .open()?;
    Ok(descriptor)
}

/// 扫描文件或目录，读取描述符类型能处理的所有媒体文件
///
/// `suffix` 为逗号分隔的后缀名，缺省时按后缀名推断内容类型来过滤
pub(crate) fn scan_media(path: &Path, dtype: DescriptorType, suffix: Option<&str>) -> anyhow::Result<Vec<MediaItem>> {
    let re_suf = suffix.map(|s| Regex::new(&format!("(?i)^({})$", s.replace(',', "|")))).transpose()?;

    info!("开始扫描: {}", path.display());
    let entries: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| match &re_suf {
            Some(re) => path.extension().is_some_and(|ext| re.is_match(&ext.to_string_lossy())),
            None => guess_content_type(path).is_some_and(|ct| dtype.accepts(ct)),
        })
        .collect();
    info!("找到 {} 个文件", entries.len());

    let pb = ProgressBar::new(entries.len() as u64).with_style(pb_style());
    let items: Vec<MediaItem> = entries
        .into_par_iter()
        .progress_with(pb.clone())
        .filter_map(|path| match MediaItem::from_file(&path) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("无法读取 {}: {e}", path.display());
                None
            }
        })
        .collect();
    pb.finish_and_clear();

    // 按后缀名选中但内容类型不匹配的文件不会被处理，提前过滤掉
    let (items, skipped): (Vec<_>, Vec<_>) = items.into_iter().partition(|item| dtype.accepts(item.content_type()));
    if !skipped.is_empty() {
        warn!("跳过 {} 个 {} 不支持的文件", skipped.len(), dtype);
    }
    Ok(items)
}
