pub mod cpu;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use cpu::CpuEmbedder;
pub use stub::{StubEmbedder, StubFace};

#[cfg(feature = "backend-tract")]
pub use tract::TractEmbedder;
