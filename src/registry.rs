use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

/// colorDescriptor 支持的局部特征类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    RgbHistogram,
    OpponentHistogram,
    HueHistogram,
    NrgHistogram,
    TransformedColorHistogram,
    ColorMoments,
    ColorMomentInvariants,
    Sift,
    HueSift,
    HsvSift,
    OpponentSift,
    RgSift,
    CSift,
    RgbSift,
}

impl DescriptorKind {
    pub const ALL: [Self; 14] = [
        Self::RgbHistogram,
        Self::OpponentHistogram,
        Self::HueHistogram,
        Self::NrgHistogram,
        Self::TransformedColorHistogram,
        Self::ColorMoments,
        Self::ColorMomentInvariants,
        Self::Sift,
        Self::HueSift,
        Self::HsvSift,
        Self::OpponentSift,
        Self::RgSift,
        Self::CSift,
        Self::RgbSift,
    ];

    /// colorDescriptor 命令行中使用的名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RgbHistogram => "rgbhistogram",
            Self::OpponentHistogram => "opponenthistogram",
            Self::HueHistogram => "huehistogram",
            Self::NrgHistogram => "nrghistogram",
            Self::TransformedColorHistogram => "transformedcolorhistogram",
            Self::ColorMoments => "colormoments",
            Self::ColorMomentInvariants => "colormomentinvariants",
            Self::Sift => "sift",
            Self::HueSift => "huesift",
            Self::HsvSift => "hsvsift",
            Self::OpponentSift => "opponentsift",
            Self::RgSift => "rgsift",
            Self::CSift => "csift",
            Self::RgbSift => "rgbsift",
        }
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DescriptorKind {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(DescriptorError::UnknownKind(s))
    }
}

/// 媒体类型
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// 静态图片
    Image,
    /// 视频，按固定间隔抽帧后逐帧提取
    Video,
}

const IMAGE_CONTENT_TYPES: [&str; 4] = ["image/bmp", "image/jpeg", "image/png", "image/tiff"];

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    /// 判断该媒体类型能否处理给定的 MIME 类型
    pub fn accepts(&self, content_type: &str) -> bool {
        let content_type = content_type.trim().to_ascii_lowercase();
        match self {
            Self::Image => IMAGE_CONTENT_TYPES.contains(&content_type.as_str()),
            // 暂时假设 ffmpeg 能解码所有视频
            Self::Video => content_type.starts_with("video/"),
        }
    }

    /// 生成码本时使用的描述符总数上限
    pub fn descriptor_limit(&self) -> usize {
        match self {
            Self::Image => 1_000_000,
            // 视频有多帧，上限适当放宽
            Self::Video => 1_500_000,
        }
    }

    /// 视频的抽帧参数，图片返回 None
    pub fn frame_sampling(&self) -> Option<FrameSampling> {
        match self {
            Self::Image => None,
            Self::Video => Some(FrameSampling::default()),
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 视频抽帧参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSampling {
    /// 起始位置，占视频总时长的比例
    pub offset_fraction: f64,
    /// 抽帧间隔（秒）
    pub interval_seconds: f64,
    /// 覆盖时长，占视频总时长的比例
    pub duration_fraction: f64,
    /// 输出图片格式
    pub image_ext: String,
}

impl Default for FrameSampling {
    fn default() -> Self {
        Self {
            offset_fraction: 0.0,
            interval_seconds: 0.5,
            duration_fraction: 1.0,
            image_ext: "png".to_string(),
        }
    }
}

impl FrameSampling {
    /// 根据视频时长计算所有采样时间点（秒）
    pub fn timestamps(&self, duration: f64) -> Vec<f64> {
        if duration.is_nan() || duration <= 0.0 || self.interval_seconds <= 0.0 {
            return vec![];
        }
        let start = duration * self.offset_fraction;
        let end = (start + duration * self.duration_fraction).min(duration);
        let mut stamps = vec![];
        let mut t = start;
        while t < end {
            stamps.push(t);
            t = start + self.interval_seconds * stamps.len() as f64;
        }
        stamps
    }
}

/// 描述符类型 = 特征类型 + 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorType {
    pub kind: DescriptorKind,
    pub modality: Modality,
}

impl DescriptorType {
    pub fn new(kind: DescriptorKind, modality: Modality) -> Self {
        Self { kind, modality }
    }

    /// 所有可用的描述符类型
    pub fn all() -> impl Iterator<Item = DescriptorType> {
        DescriptorKind::ALL.into_iter().flat_map(|kind| {
            [Modality::Image, Modality::Video].into_iter().map(move |m| Self::new(kind, m))
        })
    }

    /// 能处理给定 MIME 类型的所有描述符类型
    pub fn for_content_type(content_type: &str) -> impl Iterator<Item = DescriptorType> + '_ {
        Self::all().filter(move |t| t.accepts(content_type))
    }

    pub fn accepts(&self, content_type: &str) -> bool {
        self.modality.accepts(content_type)
    }

    pub fn name(&self) -> String {
        format!("ColorDescriptor_{}_{}", self.modality, self.kind)
    }
}

impl fmt::Display for DescriptorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in DescriptorKind::ALL {
            assert_eq!(kind.as_str().parse::<DescriptorKind>().unwrap(), kind);
        }
        assert_eq!("CSIFT".parse::<DescriptorKind>().unwrap(), DescriptorKind::CSift);
        assert!("surf".parse::<DescriptorKind>().is_err());
    }

    #[test]
    fn test_accepts() {
        assert!(Modality::Image.accepts("image/png"));
        assert!(Modality::Image.accepts("IMAGE/JPEG"));
        assert!(!Modality::Image.accepts("image/gif"));
        assert!(Modality::Video.accepts("video/mp4"));
        assert!(!Modality::Video.accepts("image/png"));
    }

    #[test]
    fn test_all_types() {
        assert_eq!(DescriptorType::all().count(), 28);
        assert_eq!(DescriptorType::for_content_type("video/webm").count(), 14);
        assert!(DescriptorType::for_content_type("text/plain").next().is_none());
    }

    #[test]
    fn test_timestamps() {
        let sampling = FrameSampling::default();
        assert_eq!(sampling.timestamps(2.0), vec![0.0, 0.5, 1.0, 1.5]);
        assert!(sampling.timestamps(0.0).is_empty());

        let half = FrameSampling { offset_fraction: 0.5, duration_fraction: 0.25, ..sampling };
        assert_eq!(half.timestamps(4.0), vec![2.0, 2.5]);
    }
}
