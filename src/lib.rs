//! Streaming LDA model selection and refit for spatial count data.
//!
//! The long-format (unit, feature, count) input is turned into a sparse
//! unit x feature matrix, several online LDA candidates are trained on a
//! train/test split and scored by held-out likelihood and marker coherence,
//! and the best candidate is refitted over the re-streamed input.

pub mod core;
pub mod utils;

pub use crate::core::methods::lda_model_selection::{run_lda_model_selection, RunSummary};
pub use crate::utils::config::TopicFitConfig;
pub use crate::utils::errors::{LdaError, LdaResult};
