use serde::{Deserialize, Serialize};

use crate::core::data::sparse_structures::*;
use crate::utils::config::NormalisationMode;
use crate::utils::general::quantile;

/// Quantile of the row sums (or size factors) used for the scaling constant
const SCALE_QUANTILE: f64 = 0.95;

/// Normalisation parameters fixed on the full corpus
///
/// Computed once before the train/test split and re-applied unchanged to
/// every streamed batch, so that the refit sees data on the same scale as
/// the candidate training.
///
/// ### Fields
///
/// * `mode` - The normalisation mode.
/// * `scale_const` - Divisor applied after `ln_1p`; `1.0` for raw counts.
/// * `unit_sum_mean` - Mean row sum of the corpus, the reference for size
///   factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normaliser {
    pub mode: NormalisationMode,
    pub scale_const: f64,
    pub unit_sum_mean: f64,
}

impl Normaliser {
    /// Fit the normalisation parameters on the full corpus
    ///
    /// ### Params
    ///
    /// * `mode` - The normalisation mode.
    /// * `matrix` - The full CSR count matrix (all units, before splitting).
    ///
    /// ### Returns
    ///
    /// The fitted `Normaliser`
    pub fn fit(mode: NormalisationMode, matrix: &CompressedSparseData<u32>) -> Self {
        let row_sums = matrix.outer_sums();
        let unit_sum_mean = if row_sums.is_empty() {
            0.0
        } else {
            row_sums.iter().sum::<f64>() / row_sums.len() as f64
        };

        let scale_const = match mode {
            NormalisationMode::Raw => 1.0,
            NormalisationMode::L1Log => (1.0 / quantile(&row_sums, SCALE_QUANTILE)).ln_1p(),
            NormalisationMode::SizeFactorLog => {
                let size_factors: Vec<f64> = row_sums.iter().map(|s| s / unit_sum_mean).collect();
                (1.0 / quantile(&size_factors, SCALE_QUANTILE)).ln_1p()
            }
        };

        Self {
            mode,
            scale_const,
            unit_sum_mean,
        }
    }

    /// Apply the normalisation to a CSR count matrix
    ///
    /// ### Params
    ///
    /// * `matrix` - CSR counts, e.g. one streamed batch.
    ///
    /// ### Returns
    ///
    /// The normalised CSR matrix with the same sparsity pattern
    pub fn apply(&self, matrix: &CompressedSparseData<u32>) -> CompressedSparseData<f64> {
        let mut res = matrix.map_values(|&v| v as f64);
        if self.mode == NormalisationMode::Raw {
            return res;
        }

        let row_sums = res.outer_sums();
        for (row, &sum) in row_sums.iter().enumerate() {
            let divisor = match self.mode {
                NormalisationMode::L1Log => sum,
                NormalisationMode::SizeFactorLog => sum / self.unit_sum_mean,
                NormalisationMode::Raw => 1.0,
            };
            for v in &mut res.data[res.indptr[row]..res.indptr[row + 1]] {
                *v = (*v / divisor).ln_1p() / self.scale_const;
            }
        }
        res
    }
}

///////////
// Tests //
///////////
