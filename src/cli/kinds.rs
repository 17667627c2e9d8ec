use anyhow::Result;
use clap::Parser;

use crate::Opts;
use crate::cli::SubCommandExtend;
use crate::registry::DescriptorType;

#[derive(Parser, Debug, Clone)]
pub struct KindsCommand {
    /// 只列出能处理该 MIME 类型的描述符类型，例如 image/png
    #[arg(short, long, value_name = "MIME")]
    pub content_type: Option<String>,
    /// 同时显示模型是否已生成
    #[arg(long)]
    pub status: bool,
}

impl SubCommandExtend for KindsCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let types: Vec<DescriptorType> = match &self.content_type {
            Some(ct) => DescriptorType::for_content_type(ct).collect(),
            None => DescriptorType::all().collect(),
        };
        let dirs = opts.dirs();
        for dtype in types {
            if self.status {
                let trained = if dirs.model_files(dtype).has_model() { "trained" } else { "-" };
                println!("{}\t{}\t{}\t{trained}", dtype.name(), dtype.kind, dtype.modality);
            } else {
                println!("{}\t{}\t{}", dtype.name(), dtype.kind, dtype.modality);
            }
        }
        Ok(())
    }
}
