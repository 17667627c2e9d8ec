use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, bounded};
use indicatif::ProgressBar;
use log::{Level, debug, error, info, warn};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::checkpoint::CheckpointStore;
use crate::error::{DescriptorError, Result};
use crate::extract::{DescriptorExtractor, FrameSampler, RawExtraction, SampledFrames, TableShape};
use crate::matrix::{DEFAULT_DESCRIPTOR_WIDTH, INFO_WIDTH, RawTables, subsample_indices, vstack};
use crate::media::MediaItem;
use crate::registry::{DescriptorType, Modality};
use crate::utils::{SimpleTimer, build_pool, pb_style};

/// 所有条目的描述符纵向拼接而成的矩阵，仅用于生成码本
#[derive(Debug, Clone)]
pub struct CombinedMatrix {
    pub info: Array2<f64>,
    pub descriptors: Array2<f32>,
    /// 按顺序排列的 (内容哈希, 行数)
    pub items: Vec<(String, usize)>,
}

impl CombinedMatrix {
    pub fn rows(&self) -> usize {
        self.descriptors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }
}

/// 单个条目的提取结果来源：图片只有一个，视频每帧一个
type Sources = Vec<(Option<usize>, TableShape)>;

/// 已提交但尚未收集的任务
enum Pending {
    Image(Receiver<Result<TableShape>>),
    Video {
        path: PathBuf,
        frames: Vec<(usize, Receiver<Result<TableShape>>)>,
        // 所有帧的任务完成前不能删除帧图片
        _sampled: SampledFrames,
    },
    Failed(DescriptorError),
}

impl Pending {
    fn collect(self) -> Result<Sources> {
        match self {
            Self::Image(rx) => Ok(vec![(None, recv(&rx)?)]),
            Self::Video { path, frames, _sampled } => {
                let total = frames.len();
                let mut sources = vec![];
                let mut last_error = None;
                for (frame, rx) in frames {
                    match recv(&rx) {
                        Ok(shape) => sources.push((Some(frame), shape)),
                        Err(e) => {
                            warn!("第 {frame} 帧特征提取失败：{e}");
                            last_error = Some(e);
                        }
                    }
                }
                if sources.is_empty() {
                    return Err(last_error.unwrap_or_else(|| DescriptorError::frame_extraction(&path, "没有可用的帧")));
                }
                if sources.len() < total {
                    warn!("{}: {total} 帧中有 {} 帧失败", path.display(), total - sources.len());
                }
                Ok(sources)
            }
            Self::Failed(e) => Err(e),
        }
    }
}

fn recv(rx: &Receiver<Result<TableShape>>) -> Result<TableShape> {
    rx.recv().unwrap_or_else(|_| Err(DescriptorError::extraction("", "任务意外中断")))
}

#[derive(Debug, Clone)]
struct PlanEntry {
    hash: String,
    sources: Vec<Option<usize>>,
    start: usize,
    rows: usize,
    keep: Option<Vec<usize>>,
}

/// 每个条目在合并矩阵中的位置
#[derive(Debug, Clone)]
struct AssemblyPlan {
    entries: Vec<PlanEntry>,
    height: usize,
    info_width: usize,
    descriptor_width: usize,
}

impl AssemblyPlan {
    /// 按键的顺序遍历提取结果，计算每个条目保留的行和起始行号
    fn new(results: BTreeMap<String, Result<Sources>>, per_item_limit: usize, rng: &mut StdRng) -> Self {
        let mut widths: Option<(usize, usize)> = None;
        let mut entries = vec![];
        let mut height = 0;

        for (hash, result) in results {
            let sources = match result {
                Ok(sources) => sources,
                Err(e) if e.is_recoverable() => {
                    warn!("跳过 {hash}：{e}");
                    continue;
                }
                Err(e) => {
                    error!("跳过 {hash}，非提取错误：{e}");
                    continue;
                }
            };
            let (iw, dw) = (sources[0].1.info_width, sources[0].1.descriptor_width);
            if sources.iter().any(|(_, s)| (s.info_width, s.descriptor_width) != (iw, dw)) {
                warn!("跳过 {hash}：各帧的矩阵宽度不一致");
                continue;
            }
            match widths {
                None => widths = Some((iw, dw)),
                Some(w) if w != (iw, dw) => {
                    warn!("跳过 {hash}：矩阵宽度 {:?} 与之前的 {w:?} 不一致", (iw, dw));
                    continue;
                }
                Some(_) => {}
            }

            let total: usize = sources.iter().map(|(_, s)| s.rows).sum();
            let keep = subsample_indices(total, per_item_limit, rng);
            let rows = keep.as_ref().map_or(total, Vec::len);
            debug!("{hash}: {total} 行，保留 {rows} 行");

            entries.push(PlanEntry {
                hash,
                sources: sources.into_iter().map(|(frame, _)| frame).collect(),
                start: height,
                rows,
                keep,
            });
            height += rows;
        }

        let (info_width, descriptor_width) = widths.unwrap_or((INFO_WIDTH, DEFAULT_DESCRIPTOR_WIDTH));
        Self { entries, height, info_width, descriptor_width }
    }
}

/// 并行提取多个条目的原始描述符并合并为一个矩阵
pub struct Orchestrator {
    dtype: DescriptorType,
    extractor: Arc<dyn DescriptorExtractor>,
    sampler: Arc<dyn FrameSampler>,
    store: CheckpointStore,
    temp_dir: PathBuf,
    parallel: usize,
    copy_parallel: usize,
    seed: Option<u64>,
    row_limit: Option<usize>,
}

impl Orchestrator {
    pub fn new(
        dtype: DescriptorType,
        extractor: Arc<dyn DescriptorExtractor>,
        sampler: Arc<dyn FrameSampler>,
        store: CheckpointStore,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        let cpus = num_cpus::get();
        Self {
            dtype,
            extractor,
            sampler,
            store,
            temp_dir: temp_dir.into(),
            parallel: cpus,
            copy_parallel: cpus * 2,
            seed: None,
            row_limit: None,
        }
    }

    /// 设置提取和拷贝两个阶段的并发数
    pub fn parallel(mut self, parallel: usize, copy_parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self.copy_parallel = copy_parallel.max(1);
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// 单个图片或单帧的描述符行数上限，对所有提取路径都生效
    pub fn row_limit(mut self, row_limit: Option<usize>) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub fn descriptor_type(&self) -> DescriptorType {
        self.dtype
    }

    fn raw(&self) -> RawExtraction<'_> {
        RawExtraction::new(&*self.extractor, &self.store, self.dtype.kind).with_row_limit(self.row_limit)
    }

    /// 描述符提取和视频抽帧各自的并发数
    ///
    /// 视频一半用于抽帧一半用于提取，不能平分时提取多分一个
    fn worker_split(&self) -> (usize, usize) {
        match self.dtype.modality {
            Modality::Image => (self.parallel, 0),
            Modality::Video => (self.parallel.div_ceil(2).max(1), (self.parallel / 2).max(1)),
        }
    }

    fn sample_frames(&self, item: &MediaItem, frame_workers: usize) -> Result<(PathBuf, SampledFrames)> {
        let params = self.dtype.modality.frame_sampling().unwrap_or_default();
        let copy = item.local_copy(&self.temp_dir)?;
        let frames = self.sampler.sample(copy.path(), &params, frame_workers)?;
        debug!("{} 抽取了 {} 帧", item.content_hash(), frames.len());
        Ok((copy.path().to_path_buf(), frames))
    }

    fn check_modality(&self, item: &MediaItem) -> Result<()> {
        if self.dtype.accepts(item.content_type()) {
            return Ok(());
        }
        let path = item.path().map(Path::to_path_buf).unwrap_or_default();
        Err(DescriptorError::extraction(
            path,
            format!("{} 不支持内容类型 {}", self.dtype, item.content_type()),
        ))
    }

    /// 提取所有条目的描述符，按内容哈希排序后拼接
    ///
    /// `limit` 为总行数预算，缺省时使用媒体类型的默认值。每个条目最多保留 `limit / 条目数` 行，
    /// 超出的部分随机下采样。提取失败的条目只记录日志并跳过。
    pub fn generate(&self, items: &[MediaItem], limit: Option<usize>) -> Result<CombinedMatrix> {
        let _timer = SimpleTimer::new(format!("生成 {} 描述符矩阵", self.dtype), Level::Info);

        let items: BTreeMap<&str, &MediaItem> = items.iter().map(|item| (item.content_hash(), item)).collect();
        let limit = limit.unwrap_or_else(|| self.dtype.modality.descriptor_limit());
        let per_item_limit = if items.is_empty() { limit } else { limit / items.len() };
        info!("共 {} 个条目，每个条目最多保留 {per_item_limit} 行描述符", items.len());

        let (descr_workers, frame_workers) = self.worker_split();
        let pool = build_pool(descr_workers, "extract")?;
        let raw = self.raw();
        let temp_dir = self.temp_dir.as_path();

        let pb = ProgressBar::new(items.len() as u64).with_style(pb_style());
        let results: BTreeMap<String, Result<Sources>> = pool.in_place_scope(|s| {
            let mut pending = BTreeMap::new();
            for (&hash, &item) in &items {
                if let Err(e) = self.check_modality(item) {
                    pending.insert(hash, Pending::Failed(e));
                    continue;
                }
                let job = match self.dtype.modality {
                    Modality::Image => {
                        let (tx, rx) = bounded(1);
                        let raw = &raw;
                        s.spawn(move |_| {
                            // 本地副本在任务结束时删除，无论成功与否
                            let result = item
                                .local_copy(temp_dir)
                                .map_err(DescriptorError::from)
                                .and_then(|copy| raw.ensure(hash, None, copy.path()));
                            let _ = tx.send(result);
                        });
                        Pending::Image(rx)
                    }
                    Modality::Video => match self.sample_frames(item, frame_workers) {
                        Ok((path, sampled)) => {
                            let mut frames = vec![];
                            for (&frame, image) in sampled.frames() {
                                let (tx, rx) = bounded(1);
                                let (raw, image) = (&raw, image.clone());
                                s.spawn(move |_| {
                                    let _ = tx.send(raw.ensure(hash, Some(frame), &image));
                                });
                                frames.push((frame, rx));
                            }
                            Pending::Video { path, frames, _sampled: sampled }
                        }
                        Err(e) => Pending::Failed(e),
                    },
                };
                pending.insert(hash, job);
            }

            // 按键的顺序收集，与任务完成的先后无关
            pending
                .into_iter()
                .map(|(hash, job)| {
                    let result = job.collect();
                    pb.inc(1);
                    (hash.to_string(), result)
                })
                .collect()
        });
        pb.finish_and_clear();

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let plan = AssemblyPlan::new(results, per_item_limit, &mut rng);
        info!("{} 个条目提取成功，合并后共 {} 行", plan.entries.len(), plan.height);

        self.assemble(&raw, plan)
    }

    /// 按计划分配最终矩阵，并行地把每个条目的行拷贝到各自的区间
    fn assemble(&self, raw: &RawExtraction<'_>, plan: AssemblyPlan) -> Result<CombinedMatrix> {
        let _timer = SimpleTimer::new("拷贝描述符到合并矩阵", Level::Debug);

        let mut info = Array2::<f64>::zeros((plan.height, plan.info_width));
        let mut descriptors = Array2::<f32>::zeros((plan.height, plan.descriptor_width));

        // 各条目的目标区间互不重叠，切分后可以无锁并行写入
        let mut jobs: Vec<(&PlanEntry, ArrayViewMut2<f64>, ArrayViewMut2<f32>)> = vec![];
        let (mut info_rest, mut desc_rest) = (info.view_mut(), descriptors.view_mut());
        for entry in &plan.entries {
            let (i, i_rest) = info_rest.split_at(Axis(0), entry.rows);
            let (d, d_rest) = desc_rest.split_at(Axis(0), entry.rows);
            jobs.push((entry, i, d));
            (info_rest, desc_rest) = (i_rest, d_rest);
        }

        let copy_pool = build_pool(self.copy_parallel, "copy")?;
        copy_pool.install(|| {
            jobs.into_par_iter().try_for_each(|(entry, mut info, mut descriptors)| {
                let tables = load_entry(raw, entry)?;
                if tables.info.dim() != info.dim() || tables.descriptors.dim() != descriptors.dim() {
                    return Err(DescriptorError::DimensionMismatch {
                        expected: descriptors.ncols(),
                        actual: tables.descriptors.ncols(),
                    });
                }
                info.assign(&tables.info);
                descriptors.assign(&tables.descriptors);
                Ok(())
            })
        })?;

        let items = plan.entries.into_iter().map(|e| (e.hash, e.rows)).collect();
        Ok(CombinedMatrix { info, descriptors, items })
    }

    /// 单个条目的全部原始描述符，不做下采样，失败直接返回错误
    pub fn item_tables(&self, item: &MediaItem) -> Result<RawTables> {
        self.check_modality(item)?;
        let raw = self.raw();
        let hash = item.content_hash();
        match self.dtype.modality {
            Modality::Image => {
                let copy = item.local_copy(&self.temp_dir)?;
                raw.ensure(hash, None, copy.path())?;
                raw.load(hash, None)
            }
            Modality::Video => {
                let (descr_workers, frame_workers) = self.worker_split();
                let (path, sampled) = self.sample_frames(item, frame_workers)?;
                let pool = build_pool(descr_workers, "extract")?;
                let results: Vec<_> = pool.install(|| {
                    sampled
                        .frames()
                        .par_iter()
                        .map(|(&frame, image)| (frame, raw.ensure(hash, Some(frame), image)))
                        .collect()
                });
                let frames = results.into_iter().map(|(frame, r)| (frame, bounded_ok(r))).collect();
                let sources = Pending::Video { path, frames, _sampled: sampled }.collect()?;
                let entry = PlanEntry {
                    hash: hash.to_string(),
                    sources: sources.into_iter().map(|(frame, _)| frame).collect(),
                    start: 0,
                    rows: 0,
                    keep: None,
                };
                load_entry(&raw, &entry)
            }
        }
    }
}

/// 把已完成的结果包装成通道，复用 [`Pending::collect`] 的容错逻辑
fn bounded_ok(result: Result<TableShape>) -> Receiver<Result<TableShape>> {
    let (tx, rx) = bounded(1);
    let _ = tx.send(result);
    rx
}

/// 读取条目的所有来源，拼接后按计划选取行
fn load_entry(raw: &RawExtraction<'_>, entry: &PlanEntry) -> Result<RawTables> {
    let parts = entry
        .sources
        .iter()
        .map(|&frame| raw.load(&entry.hash, frame))
        .collect::<Result<Vec<_>>>()?;
    let tables = match parts.len() {
        1 => parts.into_iter().next().unwrap_or_else(|| RawTables::empty(0)),
        _ => {
            let dw = parts.first().map_or(DEFAULT_DESCRIPTOR_WIDTH, |p| p.descriptors.ncols());
            let info: Vec<ArrayView2<f64>> = parts.iter().map(|p| p.info.view()).collect();
            let descriptors: Vec<ArrayView2<f32>> = parts.iter().map(|p| p.descriptors.view()).collect();
            RawTables { info: vstack(&info, INFO_WIDTH)?, descriptors: vstack(&descriptors, dw)? }
        }
    };
    Ok(match &entry.keep {
        Some(keep) => tables.select(keep),
        None => tables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(rows: usize) -> TableShape {
        TableShape { rows, info_width: 5, descriptor_width: 8 }
    }

    #[test]
    fn test_plan_offsets() {
        let mut results = BTreeMap::new();
        results.insert("c".to_string(), Ok(vec![(None, shape(100))]));
        results.insert("a".to_string(), Ok(vec![(None, shape(500))]));
        results.insert("b".to_string(), Ok(vec![(None, shape(2000))]));
        results.insert("d".to_string(), Err(DescriptorError::extraction("d.png", "boom")));

        let plan = AssemblyPlan::new(results, 1200 / 3, &mut StdRng::seed_from_u64(0));
        let layout: Vec<_> = plan.entries.iter().map(|e| (e.hash.as_str(), e.start, e.rows)).collect();
        assert_eq!(layout, vec![("a", 0, 400), ("b", 400, 400), ("c", 800, 100)]);
        assert_eq!(plan.height, 900);
        assert_eq!(plan.descriptor_width, 8);
        assert!(plan.entries[2].keep.is_none());
    }

    #[test]
    fn test_plan_width_mismatch() {
        let mut results = BTreeMap::new();
        results.insert("a".to_string(), Ok(vec![(None, shape(10))]));
        let odd = TableShape { rows: 10, info_width: 5, descriptor_width: 3 };
        results.insert("b".to_string(), Ok(vec![(None, odd)]));
        results.insert("c".to_string(), Ok(vec![(Some(0), shape(4)), (Some(5), odd)]));

        let plan = AssemblyPlan::new(results, 100, &mut StdRng::seed_from_u64(0));
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.height, 10);
    }

    #[test]
    fn test_plan_empty_uses_defaults() {
        let plan = AssemblyPlan::new(BTreeMap::new(), 100, &mut StdRng::seed_from_u64(0));
        assert_eq!((plan.height, plan.info_width, plan.descriptor_width), (0, INFO_WIDTH, DEFAULT_DESCRIPTOR_WIDTH));
    }

    #[test]
    fn test_video_partial_failure() {
        let frames = vec![
            (0, bounded_ok(Ok(shape(3)))),
            (5, bounded_ok(Err(DescriptorError::extraction("f5.png", "boom")))),
            (10, bounded_ok(Ok(shape(2)))),
        ];
        let pending = Pending::Video { path: "v.mp4".into(), frames, _sampled: SampledFrames::default() };
        let sources = pending.collect().unwrap();
        assert_eq!(sources.iter().map(|(f, _)| *f).collect::<Vec<_>>(), vec![Some(0), Some(10)]);

        let frames = vec![(0, bounded_ok(Err(DescriptorError::extraction("f0.png", "boom"))))];
        let pending = Pending::Video { path: "v.mp4".into(), frames, _sampled: SampledFrames::default() };
        assert!(pending.collect().is_err());
    }
}
