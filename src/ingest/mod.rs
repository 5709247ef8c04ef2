pub mod analysis_handler;
pub mod image_handler;
pub mod mover;
pub mod phash;
pub mod stable_file;

pub use analysis_handler::{AnalysisIngestHandler, AnalysisState};
pub use image_handler::{ImageIngestHandler, IngestOutcome};
pub use mover::{DirectoryBucket, MoveToBucketHandler, ObjectMover};
pub use stable_file::StableFileWaiter;
