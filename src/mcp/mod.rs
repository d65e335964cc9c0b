//! Model server protocol types

pub mod resource;

pub use resource::{download_uri, model_from_uri, DownloadProgress, DownloadStatus};
