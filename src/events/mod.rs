pub mod ingestor;

pub use ingestor::{apply_mirror_update, EventIngestor};
