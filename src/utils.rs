use std::time::Instant;

use indicatif::ProgressStyle;
use log::{Level, log};
use rayon::{ThreadPool, ThreadPoolBuilder};

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
        .expect("invalid progress bar template")
        .progress_chars("#>-")
}

/// 在作用域开始和结束时各打印一次日志，结束时附带耗时
pub struct SimpleTimer {
    msg: String,
    level: Level,
    start: Instant,
}

impl SimpleTimer {
    pub fn new(msg: impl Into<String>, level: Level) -> Self {
        let msg = msg.into();
        log!(level, "{msg}");
        Self { msg, level, start: Instant::now() }
    }
}

impl Drop for SimpleTimer {
    fn drop(&mut self) {
        log!(self.level, "{} 完成，耗时 {:.3}s", self.msg, self.start.elapsed().as_secs_f32());
    }
}

/// 将字符串按固定宽度切分为 depth 段，用于目录分片
///
/// 例：`partition_string("abcdef01", 2, 2) == ["ab", "cd"]`
pub fn partition_string(s: &str, depth: usize, width: usize) -> Vec<&str> {
    (0..depth)
        .map_while(|i| {
            let start = i * width;
            let end = start + width;
            s.get(start..end)
        })
        .collect()
}

/// 创建固定线程数的线程池
pub fn build_pool(threads: usize, name: &'static str) -> Result<ThreadPool, rayon::ThreadPoolBuildError> {
    ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |i| format!("{name}-{i}"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_string() {
        assert_eq!(partition_string("abcdef01", 2, 2), vec!["ab", "cd"]);
        assert_eq!(partition_string("abc", 2, 2), vec!["ab"]);
        assert!(partition_string("", 2, 2).is_empty());
    }
}
