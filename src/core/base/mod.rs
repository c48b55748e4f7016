//! Module containing the statistical building blocks: the chi-squared
//! enrichment test and the count normalisation

pub mod normalisation;
pub mod stats;
