//! End-to-end workflows

pub mod lda_model_selection;
