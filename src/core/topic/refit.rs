use faer::Mat;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::normalisation::Normaliser;
use crate::core::data::dge_io::DgeRecord;
use crate::core::data::output_io::TableWriter;
use crate::core::data::sparse_structures::*;
use crate::core::data::unit_loader::UnitLoader;
use crate::core::topic::online_lda::OnlineLda;
use crate::utils::errors::LdaResult;
use crate::utils::general::{array_argmax, fmt_sig4};

///////////
// Types //
///////////

/// The final model together with what is needed to apply it to new data
///
/// ### Fields
///
/// * `model` - The refitted model.
/// * `feature_names` - Feature identifiers in column order.
/// * `normaliser` - Normalisation with the corpus scaling constant and mean
///   row sum.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FittedModel {
    pub model: OnlineLda,
    pub feature_names: Vec<String>,
    pub normaliser: Normaliser,
}

impl FittedModel {
    /// Feature id to column index
    pub fn feature_dict(&self) -> FxHashMap<String, usize> {
        self.feature_names
            .iter()
            .enumerate()
            .map(|(i, f)| (f.clone(), i))
            .collect()
    }

    /// Normalise raw counts and infer their factor mixtures
    ///
    /// ### Params
    ///
    /// * `counts` - Raw CSR counts whose columns follow `feature_names`.
    ///
    /// ### Returns
    ///
    /// The mixtures, units x factors; rows sum to 1
    pub fn transform_counts(&self, counts: &CompressedSparseData<u32>) -> Mat<f64> {
        self.model.transform(&self.normaliser.apply(counts))
    }
}

/// Parameters of the streaming passes
///
/// ### Fields
///
/// * `epoch` - Refit target in batch groups.
/// * `batch_size` - Target units per streamed batch.
/// * `batch_id_prefix` - Prefix length of the batch group key.
/// * `min_ct_per_unit` - Minimum total count per unit.
/// * `debug` - Log the per-batch bound.
#[derive(Clone, Debug)]
pub struct StreamParams {
    pub epoch: f64,
    pub batch_size: usize,
    pub batch_id_prefix: usize,
    pub min_ct_per_unit: u64,
    pub debug: bool,
}

///////////
// Refit //
///////////

/// Refit a model over the streamed corpus
///
/// Each pass re-opens the source and feeds every batch to
/// `partial_fit()`. A pass stops early once more than `epoch` batch groups
/// were seen. The epoch counter starts at 0.5 and grows by the number of
/// batch groups seen in the pass (or by 1 if grouping is disabled) until
/// it reaches `epoch`.
///
/// ### Params
///
/// * `model` - The model to update.
/// * `open_source` - Opens a fresh record stream over the corpus.
/// * `feature_dict` - Feature id to column index.
/// * `normaliser` - Normalisation fitted on the corpus.
/// * `params` - Streaming parameters.
///
/// ### Returns
///
/// Number of units fed to the model
pub fn refit_model<F, I>(
    model: &mut OnlineLda,
    mut open_source: F,
    feature_dict: &FxHashMap<String, usize>,
    normaliser: &Normaliser,
    params: &StreamParams,
) -> LdaResult<usize>
where
    F: FnMut() -> LdaResult<I>,
    I: Iterator<Item = LdaResult<DgeRecord>>,
{
    let start = Instant::now();
    let mut epoch = 0.5_f64;
    let mut n_unit = 0_usize;

    while epoch < params.epoch {
        let mut loader = UnitLoader::new(
            open_source()?,
            feature_dict,
            params.min_ct_per_unit,
            params.batch_id_prefix,
        );
        let mut n_batches = 0_usize;

        while loader.update_batch(params.batch_size)? {
            n_batches += 1;
            if let Some(batch) = loader.take_batch() {
                let n = batch.mtx.nrows();
                if n > 0 {
                    let mtx = normaliser.apply(&batch.mtx);
                    model.partial_fit(&mtx);
                    n_unit += n;
                    if params.debug {
                        let logl = model.score(&mtx) / n as f64;
                        let e = loader.batch_id_list().len();
                        debug!(
                            "Epoch {}, finished {} units. batch logl: {:.4}",
                            e.saturating_sub(1),
                            n_unit,
                            logl
                        );
                    }
                }
            }
            if loader.batch_id_list().len() as f64 > params.epoch {
                break;
            }
        }

        let increment = if params.batch_id_prefix > 0 {
            loader.batch_id_list().len() as f64
        } else {
            1.0
        };
        if n_batches == 0 || increment <= 0.0 {
            warn!("Refit pass produced no batches; stopping");
            break;
        }
        epoch += increment;
    }

    info!(
        "Refit finished with {} units in {:.2?}",
        n_unit,
        start.elapsed()
    );
    Ok(n_unit)
}

////////////////////
// Posterior pass //
////////////////////

/// Header of the per-unit fit result table
///
/// ### Params
///
/// * `count_column` - Name of the training key column.
/// * `unit_attr` - Passthrough attribute columns.
/// * `n_factors` - Number of factors.
pub fn fit_result_header(
    count_column: &str,
    unit_attr: &[String],
    n_factors: usize,
) -> Vec<String> {
    let mut header = vec!["unit".to_string(), count_column.to_string()];
    header.extend(unit_attr.iter().cloned());
    header.push("topK".to_string());
    header.push("topP".to_string());
    header.extend((0..n_factors).map(|k| k.to_string()));
    header
}

/// Infer the mixtures of every streamed unit
///
/// Streams the source once, writes one row per retained unit to `writer` and
/// accumulates the posterior counts `theta^T * counts` over all batches.
///
/// ### Params
///
/// * `fitted` - The model with its normalisation.
/// * `source` - Record stream with passthrough attributes.
/// * `feature_dict` - Feature id to column index.
/// * `params` - Streaming parameters.
/// * `writer` - Writer of the per-unit table; its header has to match
///   `fit_result_header()`.
///
/// ### Returns
///
/// The posterior counts, features x factors
pub fn posterior_pass<I>(
    fitted: &FittedModel,
    source: I,
    feature_dict: &FxHashMap<String, usize>,
    params: &StreamParams,
    writer: &mut TableWriter,
) -> LdaResult<Mat<f64>>
where
    I: Iterator<Item = LdaResult<DgeRecord>>,
{
    let k = fitted.model.n_components();
    let mut post_count = Mat::<f64>::zeros(feature_dict.len(), k);
    let mut loader = UnitLoader::new(
        source,
        feature_dict,
        params.min_ct_per_unit,
        params.batch_id_prefix,
    );
    let mut n_batch = 0_usize;

    while loader.update_batch(params.batch_size)? {
        let Some(batch) = loader.take_batch() else {
            continue;
        };
        if batch.mtx.nrows() == 0 {
            continue;
        }

        let theta = fitted.transform_counts(&batch.mtx);
        let raw = batch.mtx.map_values(|&v| v as f64);
        let batch_post = csr_transpose_dense_mul(&raw, theta.as_ref());
        for i in 0..post_count.nrows() {
            for t in 0..k {
                post_count[(i, t)] += batch_post[(i, t)];
            }
        }

        for (row, meta) in batch.brc.iter().enumerate() {
            let weights: Vec<f64> = (0..k).map(|t| theta[(row, t)]).collect();
            let (top_k, top_p) = array_argmax(&weights);

            let mut fields = Vec::with_capacity(4 + meta.attrs.len() + k);
            fields.push(meta.unit.clone());
            fields.push(meta.total.to_string());
            fields.extend(meta.attrs.iter().cloned());
            fields.push(top_k.to_string());
            fields.push(fmt_sig4(top_p));
            fields.extend(weights.iter().map(|&w| fmt_sig4(w)));
            writer.write_row(&fields)?;
        }

        info!("{}-th batch with {} units", n_batch, batch.brc.len());
        n_batch += 1;
    }

    info!("Finished ({})", n_batch);
    Ok(post_count)
}

///////////
// Tests //
///////////
