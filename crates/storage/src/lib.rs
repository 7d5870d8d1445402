pub mod archive;
pub mod constants;
pub mod s3;
pub mod store;

pub use s3::S3Client;
pub use store::ArtifactStore;
