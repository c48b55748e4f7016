use faer::Mat;
use log::info;
use std::path::PathBuf;
use std::time::Instant;

use crate::core::base::normalisation::Normaliser;
use crate::core::data::dge_io::DgeReader;
use crate::core::data::output_io::*;
use crate::core::data::sparse_builder::SparseMatrixBuilder;
use crate::core::topic::coherence::CoherenceParams;
use crate::core::topic::model_selection::*;
use crate::core::topic::refit::*;
use crate::utils::config::TopicFitConfig;
use crate::utils::errors::{LdaError, LdaResult};
use crate::utils::general::fmt_sig4;

/// Summary of a finished run
///
/// ### Fields
///
/// * `n_units` - Units in the in-memory corpus.
/// * `n_features` - Features in the in-memory corpus.
/// * `best_candidate` - The selected candidate.
/// * `aggregates` - Aggregate coherence per candidate.
/// * `n_refit_units` - Units fed to the model during the refit.
/// * `outputs` - Every file written.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub n_units: usize,
    pub n_features: usize,
    pub best_candidate: usize,
    pub aggregates: Vec<(usize, f64)>,
    pub n_refit_units: usize,
    pub outputs: Vec<PathBuf>,
}

/// Model selection followed by the streaming refit
///
/// 1. Builds the corpus from the input and fits the normalisation.
/// 2. Trains `n_repeats` candidates and scores their coherence.
/// 3. Refits the best candidate over the re-streamed input.
/// 4. Infers the mixture of every streamed unit and writes the results.
///
/// ### Params
///
/// * `cfg` - The configuration; validated here.
///
/// ### Returns
///
/// The `RunSummary`
pub fn run_lda_model_selection(cfg: TopicFitConfig) -> LdaResult<RunSummary> {
    let cfg = cfg.validate()?;
    let start_total = Instant::now();
    let mut outputs = Vec::new();

    // corpus
    let reader = DgeReader::open(&cfg.input, &cfg.columns, false)?;
    let corpus = SparseMatrixBuilder::new(cfg.min_ct_per_unit, cfg.min_ct_per_feature)
        .build(reader)?;
    let n_units = corpus.matrix.nrows();
    let n_features = corpus.matrix.ncols();
    if n_units < 2 {
        return Err(LdaError::InvalidConfig(format!(
            "at least 2 units are needed for a train/test split, got {}",
            n_units
        )));
    }

    let normaliser = Normaliser::fit(cfg.normalisation, &corpus.matrix);
    info!(
        "Normalisation {:?} with scaling constant {:.4}",
        normaliser.mode, normaliser.scale_const
    );
    let normalised = normaliser.apply(&corpus.matrix);
    let counts = corpus.matrix.map_values(|&v| v as f64);
    let weights = corpus.feature_weights();
    let feature_ids = corpus.feature_ids();

    // candidates
    let params = CandidateParams {
        n_factors: cfg.n_factors,
        n_repeats: cfg.n_repeats,
        epoch_init: cfg.epoch_init,
        test_split: cfg.test_split,
        batch_size: cfg.batch_size,
        seed: cfg.seed,
        coherence: CoherenceParams {
            top_markers: cfg.top_markers,
            score_feature_min: cfg.score_feature_min,
            n_slices: cfg.threads,
        },
    };
    let CandidateSet {
        mut candidates,
        coherence_table,
        ..
    } = train_candidates(&normalised, &counts, &weights, &params);
    drop(normalised);
    drop(counts);

    let path = cfg.output_path("model_selection_candidates.p");
    save_bincode(&path, &candidates)?;
    outputs.push(path);
    let path = cfg.output_path("coherence.tsv");
    write_coherence_table(&path, &coherence_table)?;
    outputs.push(path);

    // selection
    let aggregates: Vec<(usize, f64)> = candidates
        .iter()
        .map(|(&r, c)| (r, aggregate_coherence(&c.coherence, cfg.coherence_aggregate)))
        .collect();
    let best_candidate = select_best(&aggregates);
    info!(
        "Selected candidate {} with {:?} coherence {:.4}",
        best_candidate, cfg.coherence_aggregate, aggregates[best_candidate].1
    );
    let mut model = candidates
        .remove(&best_candidate)
        .map(|c| c.model)
        .ok_or_else(|| LdaError::InvalidConfig("no candidate was trained".to_string()))?;
    drop(candidates);

    // refit
    let stream = StreamParams {
        epoch: cfg.epoch,
        batch_size: cfg.batch_size,
        batch_id_prefix: cfg.batch_id_prefix,
        min_ct_per_unit: cfg.min_ct_per_unit,
        debug: cfg.debug,
    };
    let n_refit_units = refit_model(
        &mut model,
        || DgeReader::open(&cfg.input, &cfg.columns, false),
        &corpus.feature_dict,
        &normaliser,
        &stream,
    )?;

    let fitted = FittedModel {
        model,
        feature_names: feature_ids.clone(),
        normaliser,
    };

    // posterior
    let path = cfg.output_path("fit_result.tsv.gz");
    info!("Result file {}", path.display());
    let header = fit_result_header(&cfg.columns.count, &cfg.columns.unit_attr, cfg.n_factors);
    let mut writer = TableWriter::create(&path, &header)?;
    let source = DgeReader::open(&cfg.input, &cfg.columns, true)?;
    let post_count = posterior_pass(&fitted, source, &corpus.feature_dict, &stream, &mut writer)?;
    outputs.push(writer.finish()?);

    let path = cfg.output_path("posterior.count.tsv.gz");
    write_feature_matrix(
        &path,
        &cfg.columns.feature,
        &feature_ids,
        post_count.as_ref(),
        |v| format!("{:.2}", v),
    )?;
    outputs.push(path);

    let path = cfg.output_path("model.p");
    save_bincode(&path, &fitted)?;
    outputs.push(path);

    let components = &fitted.model.components;
    let components_t = Mat::from_fn(components.ncols(), components.nrows(), |i, k| {
        components[(k, i)]
    });
    let path = cfg.output_path("model_matrix.tsv.gz");
    write_feature_matrix(
        &path,
        &cfg.columns.feature,
        &feature_ids,
        components_t.as_ref(),
        fmt_sig4,
    )?;
    outputs.push(path);

    info!("Finished in {:.2?}", start_total.elapsed());

    Ok(RunSummary {
        n_units,
        n_features,
        best_candidate,
        aggregates,
        n_refit_units,
        outputs,
    })
}
