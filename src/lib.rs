pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod extract;
pub mod index;
pub mod kmeans;
pub mod matrix;
pub mod media;
pub mod model;
pub mod orchestrator;
pub mod quantizer;
pub mod registry;
pub mod utils;

pub use config::Opts;
pub use descriptor::{ColorDescriptor, ColorDescriptorBuilder};
pub use error::{DescriptorError, Result};
pub use media::MediaItem;
pub use registry::{DescriptorKind, DescriptorType, Modality};
