use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tempfile::Builder;

use super::koen::parse_koen1;
use super::{DescriptorExtractor, run_tool};
use crate::error::{DescriptorError, Result};
use crate::matrix::RawTables;
use crate::registry::DescriptorKind;

/// 调用 colorDescriptor 可执行文件提取特征
#[derive(Debug, Clone)]
pub struct ColorDescriptorTool {
    exe: PathBuf,
    detector: String,
    ds_spacing: u32,
    timeout: Option<Duration>,
    temp_dir: PathBuf,
}

impl ColorDescriptorTool {
    pub fn new(exe: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            detector: "densesampling".to_string(),
            ds_spacing: 6,
            timeout: None,
            temp_dir: temp_dir.into(),
        }
    }

    pub fn detector(mut self, detector: impl Into<String>, ds_spacing: u32) -> Self {
        self.detector = detector.into();
        self.ds_spacing = ds_spacing;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl DescriptorExtractor for ColorDescriptorTool {
    fn extract(&self, image: &Path, kind: DescriptorKind) -> Result<RawTables> {
        std::fs::create_dir_all(&self.temp_dir)?;
        let output = Builder::new().prefix("koen-").suffix(".txt").tempfile_in(&self.temp_dir)?;

        let mut cmd = Command::new(&self.exe);
        cmd.arg(image)
            .arg("--detector")
            .arg(&self.detector)
            .arg("--ds_spacing")
            .arg(self.ds_spacing.to_string())
            .arg("--descriptor")
            .arg(kind.as_str())
            .arg("--output")
            .arg(output.path());
        run_tool(cmd, self.timeout).map_err(|reason| DescriptorError::extraction(image, reason))?;

        let text = std::fs::read_to_string(output.path()).map_err(|e| DescriptorError::extraction(image, e))?;
        parse_koen1(&text).map_err(|reason| DescriptorError::extraction(image, reason))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    /// 写一个假的 colorDescriptor 脚本，把固定内容写到 --output 指定的文件
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("colorDescriptor");
        let script = format!(
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = --output ]; then out=$2; fi\n  shift\ndone\n{body}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_extract() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_tool(dir.path(), "printf 'KOEN1\\n2\\n1\\n<CIRCLE 1 2 3 4 5>; 7 8;\\n' > \"$out\"");
        let tool = ColorDescriptorTool::new(exe, dir.path().join("temp"));
        let tables = tool.extract(Path::new("x.png"), DescriptorKind::CSift).unwrap();
        assert_eq!(tables.descriptors.row(0).to_vec(), vec![7.0, 8.0]);
    }

    #[test]
    fn test_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_tool(dir.path(), "echo 'cannot read image' >&2; exit 1");
        let tool = ColorDescriptorTool::new(exe, dir.path().join("temp"));
        let err = tool.extract(Path::new("x.png"), DescriptorKind::Sift).unwrap_err();
        assert!(matches!(err, DescriptorError::Extraction { .. }));
        assert!(err.to_string().contains("cannot read image"));
    }

    #[test]
    fn test_garbled_output() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_tool(dir.path(), "echo garbage > \"$out\"");
        let tool = ColorDescriptorTool::new(exe, dir.path().join("temp"));
        assert!(matches!(
            tool.extract(Path::new("x.png"), DescriptorKind::Sift),
            Err(DescriptorError::Extraction { .. })
        ));
    }
}
