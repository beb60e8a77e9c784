// src/config/mod.rs
pub mod lexicon;
pub mod pipeline;

pub use lexicon::Lexicon;
pub use pipeline::PipelineConfig;
