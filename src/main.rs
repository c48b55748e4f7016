use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use spatial_lda::utils::config::{
    CoherenceAggregate, ColumnBindings, NormalisationMode, TopicFitConfig,
};
use spatial_lda::run_lda_model_selection;

#[derive(Parser, Debug, Clone)]
#[command(name = "spatial-lda", version, about, long_about = None, term_width = 80)]
/// Online LDA model selection and refit on spatial count data
///
/// Trains several candidate models on a random train/test split, picks the
/// candidate with the best marker coherence and refits it over the whole
/// input, which is streamed from disk in mini-batches.
struct Args {
    /// Long-format input (tsv, optionally gzipped), grouped by unit
    #[arg(long, short)]
    input: PathBuf,

    /// Output prefix
    #[arg(long, short)]
    output: String,

    /// Number of factors
    #[arg(long = "n-factor", short = 'k')]
    n_factor: usize,

    /// Number of candidate models
    #[arg(long = "R", short = 'r', default_value_t = 5)]
    n_repeats: usize,

    /// Passes over the training split per candidate
    #[arg(long, default_value_t = 1)]
    epoch_init: usize,

    /// Refit target in batch groups
    #[arg(long, default_value_t = 1.0)]
    epoch: f64,

    /// Fraction of units in the training split; the rest is held out
    #[arg(long, default_value_t = 0.5)]
    test_split: f64,

    /// Number of worker threads
    #[arg(long, default_value_t = 1)]
    thread: usize,

    /// L1 normalise, log1p and scale the counts
    #[arg(long, default_value_t = false, conflicts_with = "log_norm_size_factor")]
    log_norm: bool,

    /// Size factor normalise, log1p and scale the counts
    #[arg(long, default_value_t = false)]
    log_norm_size_factor: bool,

    /// Unit identifier column
    #[arg(long, default_value = "random_index")]
    unit_label: String,

    /// Feature identifier column
    #[arg(long, default_value = "gene")]
    feature_label: String,

    /// Count column
    #[arg(long, default_value = "gn")]
    key: String,

    /// Passthrough columns written to the fit result
    #[arg(long, num_args = 0..)]
    unit_attr: Vec<String>,

    /// Length of the unit id prefix defining batch groups; 0 disables
    /// grouping
    #[arg(long, default_value_t = 2)]
    epoch_id_length: usize,

    /// Minimum total count per unit
    #[arg(long, default_value_t = 50)]
    min_ct_per_unit: u64,

    /// Minimum total count per feature
    #[arg(long, default_value_t = 50)]
    min_ct_per_feature: u64,

    /// Units per mini-batch
    #[arg(long, default_value_t = 512)]
    batch_size: usize,

    /// Marker features per factor for the coherence
    #[arg(long, default_value_t = 10)]
    top_markers: usize,

    /// Minimum held-out total of a feature to be ranked as marker
    #[arg(long, default_value_t = 100.0)]
    score_feature_min: f64,

    /// Aggregate of the per-factor coherence
    #[arg(long, value_enum, default_value_t = CoherenceAggregate::Mean)]
    coherence_aggregate: CoherenceAggregate,

    /// Random seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Log the per-batch bound during the refit
    #[arg(long, default_value_t = false)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> TopicFitConfig {
        let normalisation = if self.log_norm_size_factor {
            NormalisationMode::SizeFactorLog
        } else if self.log_norm {
            NormalisationMode::L1Log
        } else {
            NormalisationMode::Raw
        };

        let mut cfg = TopicFitConfig::new(self.input, &self.output, self.n_factor);
        cfg.n_repeats = self.n_repeats;
        cfg.epoch_init = self.epoch_init;
        cfg.epoch = self.epoch;
        cfg.test_split = self.test_split;
        cfg.threads = self.thread;
        cfg.normalisation = normalisation;
        cfg.columns = ColumnBindings {
            unit: self.unit_label,
            feature: self.feature_label,
            count: self.key,
            unit_attr: self.unit_attr,
        };
        cfg.batch_id_prefix = self.epoch_id_length;
        cfg.min_ct_per_unit = self.min_ct_per_unit;
        cfg.min_ct_per_feature = self.min_ct_per_feature;
        cfg.batch_size = self.batch_size;
        cfg.top_markers = self.top_markers;
        cfg.score_feature_min = self.score_feature_min;
        cfg.coherence_aggregate = self.coherence_aggregate;
        cfg.seed = self.seed;
        cfg.debug = self.debug;
        cfg
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.thread.max(1))
        .build_global()
        .context("failed to set up the thread pool")?;

    let cfg = args.into_config();
    let summary = run_lda_model_selection(cfg).context("model selection failed")?;

    info!(
        "Selected candidate {} on {} units x {} features; {} files written",
        summary.best_candidate,
        summary.n_units,
        summary.n_features,
        summary.outputs.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: [&str; 7] = ["spatial-lda", "-i", "in.tsv.gz", "-o", "run", "-k", "8"];

    #[test]
    fn test_coherence_aggregate_flag() {
        let args = Args::try_parse_from(BASE).unwrap();
        assert_eq!(args.coherence_aggregate, CoherenceAggregate::Mean);

        let mut argv = BASE.to_vec();
        argv.extend(["--coherence-aggregate", "median"]);
        let cfg = Args::try_parse_from(argv).unwrap().into_config();
        assert_eq!(cfg.coherence_aggregate, CoherenceAggregate::Median);

        let mut argv = BASE.to_vec();
        argv.extend(["--coherence-aggregate", "mode"]);
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_split_flag_reaches_config() {
        let mut argv = BASE.to_vec();
        argv.extend(["--test-split", "0.3"]);
        let cfg = Args::try_parse_from(argv).unwrap().into_config();
        assert_eq!(cfg.test_split, 0.3);
    }
}
