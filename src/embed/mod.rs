mod backend;
mod backends;
mod metric;
mod registry;

pub use backend::{EmbedError, Embedder};
#[cfg(feature = "backend-tract")]
pub use backends::TractEmbedder;
pub use backends::{CpuEmbedder, StubEmbedder, StubFace};
pub use metric::DistanceMetric;
pub use registry::EmbedderRegistry;
