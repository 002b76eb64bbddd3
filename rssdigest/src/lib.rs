// Library interface for rssdigest modules
// This allows tests and other binaries to import modules

pub mod delivery;
pub mod digest;
pub mod error;
pub mod history;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod source;
pub mod summarizer;

pub use error::DigestError;
pub use pipeline::{Pipeline, RunReport};
