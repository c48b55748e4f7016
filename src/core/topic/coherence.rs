use faer::{Mat, MatRef};
use log::warn;

use crate::core::base::stats::{chisq_enrichment_par, ChiSqRecord};
use crate::core::data::sparse_structures::*;

///////////
// Types //
///////////

/// Parameters of the coherence scoring
///
/// ### Fields
///
/// * `top_markers` - Number of marker features per factor (M).
/// * `score_feature_min` - Features whose total statistic is below this are
///   not ranked.
/// * `n_slices` - Number of parallel slices of the enrichment test.
#[derive(Clone, Debug)]
pub struct CoherenceParams {
    pub top_markers: usize,
    pub score_feature_min: f64,
    pub n_slices: usize,
}

/// Coherence of one factor
///
/// ### Fields
///
/// * `factor` - Factor index.
/// * `markers` - Marker features, ordered by descending feature weight.
/// * `score0` - Raw pair sum.
/// * `score` - Pair sum normalised by the factor's held-out weight. NaN if
///   the factor has no held-out weight.
#[derive(Clone, Debug)]
pub struct FactorCoherence {
    pub factor: usize,
    pub markers: Vec<usize>,
    pub score0: f64,
    pub score: f64,
}

/////////////
// Helpers //
/////////////

/// Descending chi2, then descending fold change, then feature index
fn marker_order(a: &ChiSqRecord, b: &ChiSqRecord) -> std::cmp::Ordering {
    b.chi2
        .total_cmp(&a.chi2)
        .then(b.fold_change.total_cmp(&a.fold_change))
        .then(a.feature.cmp(&b.feature))
}

/// Value of the CSC column at the given row via a forward-only cursor
///
/// `cursor` must only move forward, i.e. rows must be queried in ascending
/// order.
fn column_value_at(idx: &[usize], vals: &[f64], cursor: &mut usize, row: usize) -> f64 {
    while *cursor < idx.len() && idx[*cursor] < row {
        *cursor += 1;
    }
    if *cursor < idx.len() && idx[*cursor] == row {
        vals[*cursor]
    } else {
        0.0
    }
}

///////////////
// Functions //
///////////////

/// Rank the marker features of every factor
///
/// Features whose total statistic over all factors is below
/// `score_feature_min` are excluded. The factor and grand totals are taken
/// over the retained features only.
///
/// ### Params
///
/// * `info` - Statistic matrix, features x factors.
/// * `score_feature_min` - Minimum total statistic of a feature.
/// * `n_slices` - Number of parallel slices of the enrichment test.
///
/// ### Returns
///
/// Per factor the enrichment records sorted from best to worst marker
pub fn rank_markers(
    info: MatRef<f64>,
    score_feature_min: f64,
    n_slices: usize,
) -> Vec<Vec<ChiSqRecord>> {
    let n_factors = info.ncols();
    let feature_totals: Vec<f64> = (0..info.nrows())
        .map(|i| (0..n_factors).map(|k| info[(i, k)]).sum())
        .collect();
    let retained: Vec<usize> = (0..info.nrows())
        .filter(|&i| feature_totals[i] >= score_feature_min)
        .collect();

    let total_k: Vec<f64> = (0..n_factors)
        .map(|k| retained.iter().map(|&i| info[(i, k)]).sum())
        .collect();
    let total: f64 = total_k.iter().sum();

    (0..n_factors)
        .map(|k| {
            let mut records = chisq_enrichment_par(
                info,
                &retained,
                &feature_totals,
                k,
                total_k[k],
                total,
                n_slices,
            );
            records.sort_by(marker_order);
            records
        })
        .collect()
}

/// Pairwise co-occurrence coherence of one factor
///
/// The markers are expected in descending weight order. For each pair
/// `i < j` and every row where feature `i` is present, adds
/// `theta[row, k] * ln(count_j / (count_i * w_j / w_i) + 1)`.
///
/// ### Params
///
/// * `counts` - Held-out counts in CSC layout (units x features).
/// * `theta` - Held-out mixtures, units x factors.
/// * `factor` - The factor k.
/// * `markers` - Marker feature indices.
/// * `weights` - Weight of every feature.
///
/// ### Returns
///
/// Tuple of `(raw sum, sum / total weight of the factor)`
pub fn factor_coherence(
    counts: &CompressedSparseData<f64>,
    theta: MatRef<f64>,
    factor: usize,
    markers: &[usize],
    weights: &[f64],
) -> (f64, f64) {
    assert_eq!(counts.cs_type, CompressedSparseFormat::Csc);

    let mut s = 0.0;
    for (ii, &i) in markers.iter().enumerate() {
        let (rows_i, vals_i) = counts.outer_slice(i);
        for &j in &markers[ii + 1..] {
            let (rows_j, vals_j) = counts.outer_slice(j);
            let ratio = weights[j] / weights[i];
            let mut cursor = 0_usize;
            for (&row, &ci) in rows_i.iter().zip(vals_i) {
                if ci <= 0.0 {
                    continue;
                }
                let cj = column_value_at(rows_j, vals_j, &mut cursor, row);
                s += theta[(row, factor)] * (cj / (ci * ratio)).ln_1p();
            }
        }
    }

    let weight_k: f64 = (0..theta.nrows()).map(|row| theta[(row, factor)]).sum();
    let score = if weight_k > 0.0 { s / weight_k } else { f64::NAN };
    (s, score)
}

/// Coherence of every factor on the held-out split
///
/// ### Params
///
/// * `test_counts` - Raw held-out counts, CSR (units x features).
/// * `theta` - Held-out mixtures, units x factors.
/// * `weights` - Weight of every feature (pre-filter total count).
/// * `params` - The coherence parameters.
///
/// ### Returns
///
/// One `FactorCoherence` per factor, in factor order
pub fn coherence_scores(
    test_counts: &CompressedSparseData<f64>,
    theta: &Mat<f64>,
    weights: &[f64],
    params: &CoherenceParams,
) -> Vec<FactorCoherence> {
    crate::assert_nrows!(test_counts, theta);
    assert_eq!(weights.len(), test_counts.ncols());

    let info = csr_transpose_dense_mul(test_counts, theta.as_ref());
    let ranked = rank_markers(info.as_ref(), params.score_feature_min, params.n_slices);
    let counts_csc = csr_to_csc(test_counts.clone());

    ranked
        .into_iter()
        .enumerate()
        .map(|(k, records)| {
            let mut markers: Vec<usize> = records
                .iter()
                .take(params.top_markers)
                .map(|r| r.feature)
                .collect();
            markers.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]));

            let (score0, score) =
                factor_coherence(&counts_csc, theta.as_ref(), k, &markers, weights);
            if score.is_nan() {
                warn!("Factor {} has no held-out weight; its coherence is NaN", k);
            }
            FactorCoherence {
                factor: k,
                markers,
                score0,
                score,
            }
        })
        .collect()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::general::nan_mean;
    use approx::assert_relative_eq;
    use faer::mat;

    /// Held-out counts, 4 units x 3 features
    /// [[4,2,0],[0,3,1],[2,0,5],[1,1,1]]
    fn counts(scale: f64) -> CompressedSparseData<f64> {
        let data = [4.0, 2.0, 3.0, 1.0, 2.0, 5.0, 1.0, 1.0, 1.0].map(|v| v * scale);
        CompressedSparseData::new_csr(
            &data,
            &[0, 1, 1, 2, 0, 2, 0, 1, 2],
            &[0, 2, 4, 6, 9],
            (4, 3),
        )
    }

    fn theta() -> Mat<f64> {
        mat![[0.9, 0.1], [0.2, 0.8], [0.5, 0.5], [0.3, 0.7]]
    }

    #[test]
    fn test_factor_coherence_by_hand() {
        let csc = csr_to_csc(counts(1.0));
        let th = theta();
        let weights = [10.0, 5.0, 8.0];

        let (s0, s) = factor_coherence(&csc, th.as_ref(), 0, &[0, 1], &weights);

        // rows with feature 0: 0 (4), 2 (2), 3 (1); ratio w1/w0 = 0.5
        let expected = 0.9 * (2.0_f64 / (4.0 * 0.5)).ln_1p()
            + 0.5 * 0.0
            + 0.3 * (1.0_f64 / (1.0 * 0.5)).ln_1p();
        assert_relative_eq!(s0, expected, epsilon = 1e-12);
        assert_relative_eq!(s, expected / 1.9, epsilon = 1e-12);
    }

    #[test]
    fn test_coherence_is_scale_invariant() {
        let th = theta();
        let weights = [10.0, 5.0, 8.0];
        let markers = [0, 2, 1];
        let a = factor_coherence(&csr_to_csc(counts(1.0)), th.as_ref(), 1, &markers, &weights);
        let b = factor_coherence(&csr_to_csc(counts(7.5)), th.as_ref(), 1, &markers, &weights);
        assert_relative_eq!(a.1, b.1, epsilon = 1e-12);
    }

    #[test]
    fn test_mean_coherence_is_scale_invariant() {
        let params = CoherenceParams {
            top_markers: 3,
            score_feature_min: 0.0,
            n_slices: 2,
        };
        let weights = [10.0, 5.0, 8.0];
        let mean_at = |scale: f64| {
            let res = coherence_scores(&counts(scale), &theta(), &weights, &params);
            let scores: Vec<f64> = res.iter().map(|fc| fc.score).collect();
            nan_mean(&scores)
        };

        let base = mean_at(1.0);
        assert!(base.is_finite());
        assert_relative_eq!(base, mean_at(7.5), epsilon = 1e-10);
        assert_relative_eq!(base, mean_at(0.25), epsilon = 1e-10);
    }

    #[test]
    fn test_zero_weight_factor_is_nan() {
        let th = mat![[1.0, 0.0], [1.0, 0.0], [1.0, 0.0], [1.0, 0.0]];
        let (s0, s) =
            factor_coherence(&csr_to_csc(counts(1.0)), th.as_ref(), 1, &[0, 1], &[1.0; 3]);
        assert_eq!(s0, 0.0);
        assert!(s.is_nan());
    }

    #[test]
    fn test_rank_markers_filters_and_orders() {
        // feature 2 is below the minimum total
        let info = mat![[90.0, 10.0], [10.0, 90.0], [1.0, 1.0], [50.0, 50.0]];
        let ranked = rank_markers(info.as_ref(), 5.0, 2);

        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().flatten().all(|r| r.feature != 2));
        assert_eq!(ranked[0][0].feature, 0);
        assert_eq!(ranked[1][0].feature, 1);
        assert!(ranked[0].windows(2).all(|w| w[0].chi2 >= w[1].chi2));
    }

    #[test]
    fn test_coherence_scores_shapes() {
        let params = CoherenceParams {
            top_markers: 2,
            score_feature_min: 0.0,
            n_slices: 2,
        };
        let res = coherence_scores(&counts(1.0), &theta(), &[10.0, 5.0, 8.0], &params);

        assert_eq!(res.len(), 2);
        for fc in &res {
            assert!(fc.markers.len() <= 2);
            assert!(fc.score.is_finite());
            let w = [10.0, 5.0, 8.0];
            assert!(fc.markers.windows(2).all(|m| w[m[0]] >= w[m[1]]));
        }
    }
}
