pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod server;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{GeneratorMetadata, PipelineState, UNetGenerator};
pub use pipeline::InferencePipeline;
pub use server::build_router;
