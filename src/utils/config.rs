use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::utils::errors::{LdaError, LdaResult};

///////////
// Enums //
///////////

/// Normalisation applied to counts before they reach the topic model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NormalisationMode {
    /// Raw counts
    #[default]
    Raw,
    /// L1 row normalisation, `ln_1p`, division by the scaling constant
    L1Log,
    /// Size factor normalisation, `ln_1p`, division by the scaling constant
    SizeFactorLog,
}

/// How per-factor coherence scores are collapsed into one candidate score
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
pub enum CoherenceAggregate {
    #[default]
    Mean,
    Median,
}

////////////////
// Structures //
////////////////

/// Column bindings into the long-format input
///
/// ### Fields
///
/// * `unit` - Column holding the unit identifier.
/// * `feature` - Column holding the feature identifier.
/// * `count` - Column holding the counts (also the "training key").
/// * `unit_attr` - Passthrough columns carried into the fit results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnBindings {
    pub unit: String,
    pub feature: String,
    pub count: String,
    pub unit_attr: Vec<String>,
}

impl Default for ColumnBindings {
    fn default() -> Self {
        Self {
            unit: "random_index".to_string(),
            feature: "gene".to_string(),
            count: "gn".to_string(),
            unit_attr: Vec::new(),
        }
    }
}

/// Full configuration of a model selection + refit run
///
/// ### Fields
///
/// * `input` - Long-format input table (`.tsv` or `.tsv.gz`).
/// * `output` - Output prefix.
/// * `n_factors` - Number of factors K.
/// * `n_repeats` - Number of candidate models R.
/// * `epoch_init` - Passes over the training split per candidate.
/// * `epoch` - Refit epoch target, measured in batch groups.
/// * `test_split` - Fraction of units in the training split; the rest is
///   held out for scoring.
/// * `threads` - Worker threads for the parallel sections.
/// * `normalisation` - See `NormalisationMode`.
/// * `columns` - Column bindings.
/// * `batch_id_prefix` - Length of the unit id prefix defining a batch group.
///   `0` disables grouping.
/// * `min_ct_per_unit` - Minimum total count per unit.
/// * `min_ct_per_feature` - Minimum total count per feature.
/// * `batch_size` - Target rows per mini-batch.
/// * `top_markers` - Number of marker features per factor for coherence.
/// * `score_feature_min` - Minimum held-out statistic total for a feature to
///   be ranked as marker.
/// * `coherence_aggregate` - How per-factor coherences are collapsed.
/// * `seed` - Base seed; candidate `r` uses `seed + r`.
/// * `debug` - Emit per-batch diagnostics during the refit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicFitConfig {
    pub input: PathBuf,
    pub output: String,
    pub n_factors: usize,
    pub n_repeats: usize,
    pub epoch_init: usize,
    pub epoch: f64,
    pub test_split: f64,
    pub threads: usize,
    pub normalisation: NormalisationMode,
    pub columns: ColumnBindings,
    pub batch_id_prefix: usize,
    pub min_ct_per_unit: u64,
    pub min_ct_per_feature: u64,
    pub batch_size: usize,
    pub top_markers: usize,
    pub score_feature_min: f64,
    pub coherence_aggregate: CoherenceAggregate,
    pub seed: u64,
    pub debug: bool,
}

impl TopicFitConfig {
    /// Generate a configuration with the default settings
    ///
    /// ### Params
    ///
    /// * `input` - Input path.
    /// * `output` - Output prefix.
    /// * `n_factors` - Number of factors.
    pub fn new(input: impl Into<PathBuf>, output: &str, n_factors: usize) -> Self {
        Self {
            input: input.into(),
            output: output.to_string(),
            n_factors,
            n_repeats: 5,
            epoch_init: 1,
            epoch: 1.0,
            test_split: 0.5,
            threads: 1,
            normalisation: NormalisationMode::Raw,
            columns: ColumnBindings::default(),
            batch_id_prefix: 2,
            min_ct_per_unit: 50,
            min_ct_per_feature: 50,
            batch_size: 512,
            top_markers: 10,
            score_feature_min: 100.0,
            coherence_aggregate: CoherenceAggregate::Mean,
            seed: 0,
            debug: false,
        }
    }

    /// Check the configuration and normalise the column names
    ///
    /// Column names are matched case-insensitively against the input header,
    /// so they are lower-cased here once.
    ///
    /// ### Returns
    ///
    /// The validated configuration
    pub fn validate(mut self) -> LdaResult<Self> {
        if self.n_factors < 2 {
            return Err(LdaError::InvalidConfig(format!(
                "number of factors must be at least 2, got {}",
                self.n_factors
            )));
        }
        if self.n_repeats == 0 {
            return Err(LdaError::InvalidConfig(
                "number of repeats must be at least 1".to_string(),
            ));
        }
        if !(self.test_split > 0.0 && self.test_split < 1.0) {
            return Err(LdaError::InvalidConfig(format!(
                "test split must lie in (0, 1), got {}",
                self.test_split
            )));
        }
        if self.batch_size == 0 {
            return Err(LdaError::InvalidConfig(
                "batch size must be positive".to_string(),
            ));
        }
        if self.top_markers < 2 {
            return Err(LdaError::InvalidConfig(format!(
                "at least 2 marker features are needed for coherence, got {}",
                self.top_markers
            )));
        }
        if self.threads == 0 {
            return Err(LdaError::InvalidConfig(
                "thread count must be positive".to_string(),
            ));
        }
        if !self.epoch.is_finite() || self.epoch < 0.0 {
            return Err(LdaError::InvalidConfig(format!(
                "refit epoch target must be a non-negative number, got {}",
                self.epoch
            )));
        }

        self.columns.unit = self.columns.unit.to_lowercase();
        self.columns.feature = self.columns.feature.to_lowercase();
        self.columns.count = self.columns.count.to_lowercase();
        self.columns.unit_attr = self
            .columns
            .unit_attr
            .iter()
            .map(|x| x.to_lowercase())
            .collect();

        Ok(self)
    }

    /// Path of an output file
    ///
    /// ### Params
    ///
    /// * `suffix` - Suffix appended to the output prefix, e.g. `coherence.tsv`.
    pub fn output_path(&self, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.output, suffix))
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_lowercases_columns() {
        let mut cfg = TopicFitConfig::new("in.tsv.gz", "out", 4);
        cfg.columns.unit = "Random_Index".to_string();
        cfg.columns.unit_attr = vec!["X".to_string(), "Y".to_string()];

        let cfg = cfg.validate().unwrap();

        assert_eq!(cfg.columns.unit, "random_index");
        assert_eq!(cfg.columns.unit_attr, vec!["x", "y"]);
    }

    #[test]
    fn test_validate_rejects_bad_split() {
        let mut cfg = TopicFitConfig::new("in.tsv.gz", "out", 4);
        cfg.test_split = 1.0;
        assert!(matches!(cfg.validate(), Err(LdaError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_single_factor() {
        let cfg = TopicFitConfig::new("in.tsv.gz", "out", 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_output_path() {
        let cfg = TopicFitConfig::new("in.tsv.gz", "/tmp/run1", 4);
        assert_eq!(
            cfg.output_path("coherence.tsv"),
            PathBuf::from("/tmp/run1.coherence.tsv")
        );
    }

    #[test]
    fn test_coherence_aggregate_values() {
        assert_eq!(
            CoherenceAggregate::from_str("Median", true),
            Ok(CoherenceAggregate::Median)
        );
        assert!(CoherenceAggregate::from_str("mode", true).is_err());
    }
}
