use faer::Mat;
use log::info;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::core::data::sparse_structures::*;
use crate::core::topic::coherence::*;
use crate::core::topic::online_lda::*;
use crate::utils::config::CoherenceAggregate;
use crate::utils::general::{array_argmax, nan_mean, nan_median, split_indices_randomly};

///////////
// Types //
///////////

/// One trained candidate
///
/// ### Fields
///
/// * `score_train` - Per-unit variational bound on the training split.
/// * `score_test` - Per-unit variational bound on the held-out split.
/// * `model` - The trained model.
/// * `coherence` - Normalised coherence per factor (may contain NaN).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandidateResult {
    pub score_train: f64,
    pub score_test: f64,
    pub model: OnlineLda,
    pub coherence: Vec<f64>,
}

/// Row of the coherence table
#[derive(Clone, Debug, PartialEq)]
pub struct CoherenceRow {
    pub r: usize,
    pub k: usize,
    pub score0: f64,
    pub score: f64,
}

/// Parameters of the candidate training
///
/// ### Fields
///
/// * `n_factors` - Number of factors K.
/// * `n_repeats` - Number of candidates R.
/// * `epoch_init` - Passes over the training split per candidate.
/// * `test_split` - Fraction of units in the training split; the rest is
///   held out.
/// * `batch_size` - Mini-batch size of the online updates.
/// * `seed` - Seed of the split; candidate `r` is initialised with
///   `seed + r`.
/// * `coherence` - Parameters of the coherence scoring.
#[derive(Clone, Debug)]
pub struct CandidateParams {
    pub n_factors: usize,
    pub n_repeats: usize,
    pub epoch_init: usize,
    pub test_split: f64,
    pub batch_size: usize,
    pub seed: u64,
    pub coherence: CoherenceParams,
}

/// Result of the candidate training
///
/// ### Fields
///
/// * `candidates` - Candidate index to result.
/// * `coherence_table` - Per candidate and factor coherence.
/// * `train_idx` - Rows of the training split.
/// * `test_idx` - Rows of the held-out split.
pub struct CandidateSet {
    pub candidates: BTreeMap<usize, CandidateResult>,
    pub coherence_table: Vec<CoherenceRow>,
    pub train_idx: Vec<usize>,
    pub test_idx: Vec<usize>,
}

/////////////
// Helpers //
/////////////

/// Size of the training split
///
/// `round(test_split * n)`, clamped so that both splits are non-empty. The
/// remaining units form the held-out split.
///
/// ### Params
///
/// * `n` - Number of units. Must be at least 2.
/// * `test_split` - Fraction of training units.
pub fn training_size(n: usize, test_split: f64) -> usize {
    let n_train = (test_split * n as f64).round() as usize;
    n_train.clamp(1, n.saturating_sub(1).max(1))
}

/// Number of units per arg-max factor
///
/// ### Params
///
/// * `theta` - Mixtures, units x factors.
///
/// ### Returns
///
/// Vector of length K with the unit counts
pub fn factor_size_histogram(theta: &Mat<f64>) -> Vec<usize> {
    let mut hist = vec![0_usize; theta.ncols()];
    for i in 0..theta.nrows() {
        let row: Vec<f64> = (0..theta.ncols()).map(|k| theta[(i, k)]).collect();
        let (k, _) = array_argmax(&row);
        hist[k] += 1;
    }
    hist
}

/// Collapse per-factor coherences into one candidate score
///
/// NaN scores are skipped.
pub fn aggregate_coherence(scores: &[f64], aggregate: CoherenceAggregate) -> f64 {
    match aggregate {
        CoherenceAggregate::Mean => nan_mean(scores),
        CoherenceAggregate::Median => nan_median(scores),
    }
}

/// Pick the best candidate
///
/// The maximum aggregate wins, ties go to the lowest candidate index. A
/// candidate with a NaN aggregate is only chosen if every aggregate is NaN.
///
/// ### Params
///
/// * `aggregates` - Candidate index and aggregate coherence, ordered by
///   candidate index.
///
/// ### Returns
///
/// The selected candidate index
pub fn select_best(aggregates: &[(usize, f64)]) -> usize {
    let values: Vec<f64> = aggregates.iter().map(|(_, v)| *v).collect();
    let (pos, _) = array_argmax(&values);
    aggregates[pos].0
}

///////////////
// Functions //
///////////////

/// Train and score R candidate models on a random train/test split
///
/// The split is drawn once and shared by every candidate, so that their
/// held-out scores are comparable.
///
/// ### Params
///
/// * `normalised` - Normalised CSR matrix of the full corpus.
/// * `counts` - Raw CSR counts of the full corpus.
/// * `weights` - Weight of every feature.
/// * `params` - The candidate parameters.
///
/// ### Returns
///
/// The `CandidateSet`
pub fn train_candidates(
    normalised: &CompressedSparseData<f64>,
    counts: &CompressedSparseData<f64>,
    weights: &[f64],
    params: &CandidateParams,
) -> CandidateSet {
    let n = normalised.nrows();
    let mut rng = StdRng::seed_from_u64(params.seed);
    let n_train = training_size(n, params.test_split);
    let (test_idx, train_idx) = split_indices_randomly(n, n_train, &mut rng);
    info!(
        "Split {} units into {} training and {} held-out units",
        n,
        train_idx.len(),
        test_idx.len()
    );

    let train = normalised.select_rows(&train_idx);
    let test = normalised.select_rows(&test_idx);
    let test_counts = counts.select_rows(&test_idx);

    let mut candidates = BTreeMap::new();
    let mut coherence_table = Vec::with_capacity(params.n_repeats * params.n_factors);

    for r in 0..params.n_repeats {
        let start = Instant::now();
        let lda_params = OnlineLdaParams::new(
            params.n_factors,
            n,
            params.batch_size,
            params.seed.wrapping_add(r as u64),
        );
        let mut model = OnlineLda::new(lda_params, normalised.ncols());
        for _ in 0..params.epoch_init {
            model.partial_fit(&train);
        }

        let score_train = model.score(&train) / train.nrows() as f64;
        let score_test = model.score(&test) / test.nrows() as f64;
        info!("{}: {:.2}, {:.2}", r, score_train, score_test);

        let theta = model.transform(&test);
        info!("Factor sizes: {:?}", factor_size_histogram(&theta));

        let factors = coherence_scores(&test_counts, &theta, weights, &params.coherence);
        let coherence: Vec<f64> = factors.iter().map(|f| f.score).collect();
        coherence_table.extend(factors.iter().map(|f| CoherenceRow {
            r,
            k: f.factor,
            score0: f.score0,
            score: f.score,
        }));

        info!(
            "R={}, {:.2}, {:.2}, {:.2?}",
            r,
            nan_mean(&coherence),
            nan_median(&coherence),
            start.elapsed()
        );

        candidates.insert(
            r,
            CandidateResult {
                score_train,
                score_test,
                model,
                coherence,
            },
        );
    }

    CandidateSet {
        candidates,
        coherence_table,
        train_idx,
        test_idx,
    }
}

///////////
// Tests //
///////////
