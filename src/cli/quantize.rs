use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::Parser;
use log::{info, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis, stack};
use serde::Serialize;

use crate::Opts;
use crate::checkpoint::{write_bytes_atomic, write_npy_atomic};
use crate::cli::{SubCommandExtend, open_descriptor, scan_media};
use crate::config::{ExtractorOptions, ParallelOptions, TypeOptions};
use crate::error::DescriptorError;
use crate::media::MediaItem;
use crate::model::ModelParams;

#[derive(Parser, Debug, Clone)]
pub struct QuantizeCommand {
    #[command(flatten)]
    pub ty: TypeOptions,
    #[command(flatten)]
    pub parallel: ParallelOptions,
    #[command(flatten)]
    pub extractor: ExtractorOptions,
    /// 图片、视频或目录的路径
    pub path: PathBuf,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long)]
    pub suffix: Option<String>,
    /// 把所有直方图按内容哈希排序后写入该 npy 文件，同时生成同名的 json 列表
    /// 不指定时以 json 格式逐行输出到标准输出
    #[arg(short, long, value_name = "FILE", verbatim_doc_comment)]
    pub output: Option<PathBuf>,
}

#[derive(Serialize)]
struct Entry<'a> {
    hash: &'a str,
    path: Option<&'a Path>,
}

#[derive(Serialize)]
struct Line<'a> {
    hash: &'a str,
    path: Option<&'a Path>,
    histogram: Vec<f64>,
}

impl SubCommandExtend for QuantizeCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let dtype = self.ty.descriptor_type();
        let descriptor = open_descriptor(opts, dtype, ModelParams::default(), &self.parallel, &self.extractor)?;
        if !descriptor.has_model() {
            let files = descriptor.model_files();
            bail!(DescriptorError::NoModel { codebook: files.codebook.clone(), index: files.index.clone() });
        }

        let single = self.path.is_file();
        let items = if single {
            vec![MediaItem::from_file(&self.path)?]
        } else {
            scan_media(&self.path, dtype, self.suffix.as_deref())?
        };

        let by_hash: BTreeMap<&str, &MediaItem> = items.iter().map(|item| (item.content_hash(), item)).collect();
        let results = descriptor.compute_descriptors(&items)?;
        let mut done: Vec<(&MediaItem, Array1<f64>)> = vec![];
        let mut failed = 0;
        // 结果已按内容哈希排序，同一内容的多个文件只输出一次
        for (hash, result) in results {
            let Some(&item) = by_hash.get(hash.as_str()) else { continue };
            match result {
                Ok(hist) => done.push((item, hist)),
                Err(e) if single => bail!("{} 量化失败: {e}", self.path.display()),
                Err(e) => {
                    failed += 1;
                    warn!("{} 量化失败: {e}", item.path().unwrap_or(Path::new(&hash)).display());
                }
            }
        }
        info!("{} 个条目量化成功，{failed} 个失败", done.len());

        match &self.output {
            Some(output) => write_output(output, &done)?,
            None => {
                for (item, hist) in &done {
                    let line = Line { hash: item.content_hash(), path: item.path(), histogram: hist.to_vec() };
                    println!("{}", serde_json::to_string(&line)?);
                }
            }
        }
        Ok(())
    }
}

fn write_output(output: &Path, done: &[(&MediaItem, Array1<f64>)]) -> Result<()> {
    let k = done.first().map_or(0, |(_, hist)| hist.len());
    let views: Vec<ArrayView1<f64>> = done.iter().map(|(_, hist)| hist.view()).collect();
    let matrix = if views.is_empty() { Array2::zeros((0, k)) } else { stack(Axis(0), &views)? };
    write_npy_atomic(output, &matrix)?;

    let entries: Vec<Entry> = done.iter().map(|(item, _)| Entry { hash: item.content_hash(), path: item.path() }).collect();
    let listing = output.with_extension("json");
    write_bytes_atomic(&listing, serde_json::to_string_pretty(&entries)?.as_bytes())?;
    info!("直方图已保存到 {}，列表保存到 {}", output.display(), listing.display());
    Ok(())
}
