//! Online topic model, candidate scoring and the streaming refit

pub mod coherence;
pub mod model_selection;
pub mod online_lda;
pub mod refit;
