use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use log::warn;
use rayon::prelude::*;
use serde::Deserialize;
use tempfile::Builder;

use super::{FrameSampler, SampledFrames, run_tool};
use crate::error::{DescriptorError, Result};
use crate::registry::FrameSampling;
use crate::utils::build_pool;

#[derive(Deserialize)]
struct Probe {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// 视频的时长（秒）和帧率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMeta {
    pub duration: f64,
    pub fps: f64,
}

fn parse_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => num.trim().parse::<f64>().ok()? / den.trim().parse::<f64>().ok()?,
        None => rate.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

fn parse_probe(json: &str) -> std::result::Result<VideoMeta, String> {
    let probe: Probe = serde_json::from_str(json).map_err(|e| e.to_string())?;
    let stream = probe.streams.first().ok_or("没有视频流")?;
    let fps = [&stream.avg_frame_rate, &stream.r_frame_rate]
        .into_iter()
        .flatten()
        .find_map(|r| parse_rate(r))
        .ok_or("无法确定帧率")?;
    let duration = [probe.format.and_then(|f| f.duration), stream.duration.clone()]
        .into_iter()
        .flatten()
        .find_map(|d| d.parse::<f64>().ok().filter(|d| *d > 0.0))
        .ok_or("无法确定视频时长")?;
    Ok(VideoMeta { duration, fps })
}

/// 根据抽帧参数和视频信息计算 帧号 -> 时间点
pub fn plan_frames(params: &FrameSampling, meta: VideoMeta) -> BTreeMap<usize, f64> {
    params
        .timestamps(meta.duration)
        .into_iter()
        .map(|t| ((t * meta.fps).round() as usize, t))
        .collect()
}

/// 使用 ffprobe 获取视频信息，ffmpeg 抽取单帧
#[derive(Debug, Clone)]
pub struct FfmpegFrameSampler {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Option<Duration>,
    temp_dir: PathBuf,
}

impl FfmpegFrameSampler {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            timeout: None,
            temp_dir: temp_dir.into(),
        }
    }

    pub fn programs(mut self, ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn probe(&self, video: &Path) -> Result<VideoMeta> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "format=duration:stream=avg_frame_rate,r_frame_rate,duration"])
            .args(["-of", "json"])
            .arg(video)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| DescriptorError::frame_extraction(video, format!("无法启动 ffprobe: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DescriptorError::frame_extraction(video, stderr.trim()));
        }
        parse_probe(&String::from_utf8_lossy(&output.stdout))
            .map_err(|reason| DescriptorError::frame_extraction(video, reason))
    }

    fn extract_frame(&self, video: &Path, t: f64, output: &Path) -> std::result::Result<(), String> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-v", "error", "-y", "-ss"])
            .arg(format!("{t:.3}"))
            .arg("-i")
            .arg(video)
            .args(["-frames:v", "1"])
            .arg(output);
        run_tool(cmd, self.timeout)?;
        if output.is_file() { Ok(()) } else { Err("没有生成图片".to_string()) }
    }
}

impl FrameSampler for FfmpegFrameSampler {
    fn sample(&self, video: &Path, params: &FrameSampling, parallel: usize) -> Result<SampledFrames> {
        let meta = self.probe(video)?;
        let plan = plan_frames(params, meta);
        if plan.is_empty() {
            return Err(DescriptorError::frame_extraction(video, "采样点为空"));
        }

        std::fs::create_dir_all(&self.temp_dir)?;
        let dir = Builder::new().prefix("frames-").tempdir_in(&self.temp_dir)?;
        let pool = build_pool(parallel, "frame")?;
        let frames: BTreeMap<usize, PathBuf> = pool.install(|| {
            plan.par_iter()
                .filter_map(|(&frame, &t)| {
                    let output = dir.path().join(format!("frame_{frame:06}.{}", params.image_ext));
                    match self.extract_frame(video, t, &output) {
                        Ok(()) => Some((frame, output)),
                        Err(e) => {
                            warn!("抽取第 {frame} 帧失败 {}: {e}", video.display());
                            None
                        }
                    }
                })
                .collect()
        });

        if frames.is_empty() {
            return Err(DescriptorError::frame_extraction(video, "没有成功抽取任何帧"));
        }
        Ok(SampledFrames::in_dir(dir, frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe() {
        let json = r#"{
            "programs": [],
            "streams": [{ "avg_frame_rate": "0/0", "r_frame_rate": "30000/1001" }],
            "format": { "duration": "2.000000" }
        }"#;
        let meta = parse_probe(json).unwrap();
        assert_eq!(meta.duration, 2.0);
        assert!((meta.fps - 29.97).abs() < 0.01);

        assert!(parse_probe(r#"{"streams": []}"#).is_err());
        assert!(parse_probe(r#"{"streams": [{"r_frame_rate": "25/1"}]}"#).is_err());
    }

    #[test]
    fn test_plan_frames() {
        let meta = VideoMeta { duration: 2.0, fps: 10.0 };
        let plan = plan_frames(&FrameSampling::default(), meta);
        assert_eq!(plan.keys().copied().collect::<Vec<_>>(), vec![0, 5, 10, 15]);

        // 帧率很低时，相邻的采样点落在同一帧上只保留一个
        let meta = VideoMeta { duration: 2.0, fps: 1.0 };
        assert_eq!(plan_frames(&FrameSampling::default(), meta).len(), 3);
    }

    #[test]
    fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let sampler = FfmpegFrameSampler::new(dir.path()).programs("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        assert!(matches!(
            sampler.sample(Path::new("v.mp4"), &FrameSampling::default(), 1),
            Err(DescriptorError::FrameExtraction { .. })
        ));
    }
}
