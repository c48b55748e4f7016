use faer::MatRef;
use rayon::prelude::*;
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::assert_same_len;
use crate::utils::general::{flatten_vector, gen_even_slices};

///////////
// Types //
///////////

/// Result of the enrichment test of one feature in one factor
///
/// ### Fields
///
/// * `feature` - Column index of the feature.
/// * `factor` - Factor index.
/// * `chi2` - Pearson chi-squared statistic of the 2x2 table.
/// * `pval` - Upper tail p-value (1 degree of freedom).
/// * `fold_change` - Enrichment of the feature in the factor versus the rest.
/// * `feature_total` - Total statistic of the feature across factors.
#[derive(Clone, Debug, PartialEq)]
pub struct ChiSqRecord {
    pub feature: usize,
    pub factor: usize,
    pub chi2: f64,
    pub pval: f64,
    pub fold_change: f64,
    pub feature_total: f64,
}

///////////////
// Functions //
///////////////

/// Pearson chi-squared statistic of a 2x2 contingency table
///
/// No continuity correction is applied.
///
/// ### Params
///
/// * `tab` - The table in row-major order.
///
/// ### Returns
///
/// The chi-squared statistic
pub fn chisq_2x2(tab: [[f64; 2]; 2]) -> f64 {
    let row = [tab[0][0] + tab[0][1], tab[1][0] + tab[1][1]];
    let col = [tab[0][0] + tab[1][0], tab[0][1] + tab[1][1]];
    let total = row[0] + row[1];

    let mut chi2 = 0.0;
    for i in 0..2 {
        for j in 0..2 {
            let expected = row[i] * col[j] / total;
            chi2 += (tab[i][j] - expected).powi(2) / expected;
        }
    }
    chi2
}

/// Enrichment test of a set of features in one factor
///
/// For each feature a 2x2 table of (feature, rest) x (factor, rest) is built
/// from the statistic matrix. The cells are rounded and shifted by one
/// pseudo-count before the test. Features with a non-positive statistic in
/// the factor are skipped.
///
/// ### Params
///
/// * `factor` - Factor index.
/// * `features` - Column indices of the features to test.
/// * `values` - Statistic of each feature in the factor.
/// * `feature_totals` - Total statistic of each feature.
/// * `total_k` - Total statistic of the factor.
/// * `total` - Total statistic over all factors.
///
/// ### Returns
///
/// The `ChiSqRecord`s in input order
pub fn chisq_enrichment(
    factor: usize,
    features: &[usize],
    values: &[f64],
    feature_totals: &[f64],
    total_k: f64,
    total: f64,
) -> Vec<ChiSqRecord> {
    assert_same_len!(features, values, feature_totals);

    let mut res = Vec::new();
    if total_k <= 0.0 {
        return res;
    }
    // 1 degree of freedom is always valid
    let dist = ChiSquared::new(1.0).unwrap();

    for ((&feature, &x), &feature_total) in features.iter().zip(values).zip(feature_totals) {
        if x <= 0.0 {
            continue;
        }
        let tab = [
            [x, feature_total - x],
            [total_k - x, total - total_k - feature_total + x],
        ];
        let fold_change = tab[0][0] / total_k / tab[0][1] * (total - total_k);
        let shifted = tab.map(|r| r.map(|v| v.round().max(0.0) + 1.0));
        let chi2 = chisq_2x2(shifted);

        res.push(ChiSqRecord {
            feature,
            factor,
            chi2,
            pval: dist.sf(chi2),
            fold_change,
            feature_total,
        });
    }

    res
}

/// Parallel enrichment test of all features in one factor
///
/// The features are cut into `n_slices` even, contiguous slices which are
/// tested in parallel; the results are concatenated in feature order.
///
/// ### Params
///
/// * `info` - Statistic matrix, features x factors.
/// * `features` - Rows of `info` to test.
/// * `feature_totals` - Total statistic of each row of `info`.
/// * `factor` - The factor (column of `info`) to test.
/// * `total_k` - Total statistic of the factor over `features`.
/// * `total` - Total statistic over `features` and all factors.
/// * `n_slices` - Number of slices / parallel tasks.
///
/// ### Returns
///
/// The `ChiSqRecord`s in the order of `features`
pub fn chisq_enrichment_par(
    info: MatRef<f64>,
    features: &[usize],
    feature_totals: &[f64],
    factor: usize,
    total_k: f64,
    total: f64,
    n_slices: usize,
) -> Vec<ChiSqRecord> {
    let slices = gen_even_slices(features.len(), n_slices);

    let res: Vec<Vec<ChiSqRecord>> = slices
        .into_par_iter()
        .map(|range| {
            let idx = &features[range];
            let values: Vec<f64> = idx.iter().map(|&i| info[(i, factor)]).collect();
            let totals: Vec<f64> = idx.iter().map(|&i| feature_totals[i]).collect();
            chisq_enrichment(factor, idx, &values, &totals, total_k, total)
        })
        .collect();

    flatten_vector(res)
}

///////////
// Tests //
///////////
