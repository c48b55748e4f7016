use faer::Mat;
use rand::prelude::*;
use rand_distr::{Distribution, Gamma};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::{digamma, ln_gamma};

use crate::core::data::sparse_structures::*;
use crate::utils::general::gen_even_slices;

/// Added to the normaliser of the variational update to avoid division by 0
const EPS: f64 = f64::EPSILON;

/// Shape and scale of the gamma initialisation of the variational parameters
const INIT_GAMMA_SHAPE: f64 = 100.0;
const INIT_GAMMA_SCALE: f64 = 0.01;

////////////
// Params //
////////////

/// Hyper-parameters of the online LDA
///
/// ### Fields
///
/// * `n_components` - Number of factors K.
/// * `doc_topic_prior` - Dirichlet prior of the unit-factor distributions.
/// * `topic_word_prior` - Dirichlet prior of the factor-feature
///   distributions.
/// * `learning_decay` - Exponent of the step size decay, in `(0.5, 1]`.
/// * `learning_offset` - Down-weights early iterations.
/// * `batch_size` - Rows per update within `partial_fit()`.
/// * `total_samples` - Corpus size used to scale the sufficient statistics.
/// * `max_doc_update_iter` - Maximum E-step iterations per unit.
/// * `mean_change_tol` - E-step convergence tolerance.
/// * `seed` - Seed of the random initialisations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OnlineLdaParams {
    pub n_components: usize,
    pub doc_topic_prior: f64,
    pub topic_word_prior: f64,
    pub learning_decay: f64,
    pub learning_offset: f64,
    pub batch_size: usize,
    pub total_samples: f64,
    pub max_doc_update_iter: usize,
    pub mean_change_tol: f64,
    pub seed: u64,
}

impl OnlineLdaParams {
    /// Default hyper-parameters for `n_components` factors
    ///
    /// ### Params
    ///
    /// * `n_components` - Number of factors.
    /// * `total_samples` - Number of units in the corpus.
    /// * `batch_size` - Rows per update.
    /// * `seed` - Random seed.
    pub fn new(n_components: usize, total_samples: usize, batch_size: usize, seed: u64) -> Self {
        Self {
            n_components,
            doc_topic_prior: 1.0 / n_components as f64,
            topic_word_prior: 1.0 / n_components as f64,
            learning_decay: 0.7,
            learning_offset: 10.0,
            batch_size,
            total_samples: total_samples as f64,
            max_doc_update_iter: 100,
            mean_change_tol: 1e-3,
            seed,
        }
    }
}

/////////////
// Helpers //
/////////////

/// `E[log X]` for `X ~ Dir(alpha)`, written into `out`
fn dirichlet_expectation(alpha: &[f64], out: &mut [f64]) {
    let psi_total = digamma(alpha.iter().sum::<f64>());
    for (o, &a) in out.iter_mut().zip(alpha) {
        *o = digamma(a) - psi_total;
    }
}

/// Row-wise `E[log X]` of a matrix of Dirichlet parameters
fn dirichlet_expectation_rows(mat: &Mat<f64>) -> Mat<f64> {
    let mut res = Mat::<f64>::zeros(mat.nrows(), mat.ncols());
    for i in 0..mat.nrows() {
        let row: Vec<f64> = (0..mat.ncols()).map(|j| mat[(i, j)]).collect();
        let psi_total = digamma(row.iter().sum::<f64>());
        for (j, &v) in row.iter().enumerate() {
            res[(i, j)] = digamma(v) - psi_total;
        }
    }
    res
}

fn log_sum_exp(x: &[f64]) -> f64 {
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + x.iter().map(|&v| (v - max).exp()).sum::<f64>().ln()
}

/// `E[log p(x | prior) - log q(x | distr)]` summed over the rows of `distr`
fn dirichlet_loglikelihood(prior: f64, distr: &Mat<f64>, dirichlet_distr: &Mat<f64>) -> f64 {
    let size = distr.ncols() as f64;
    let mut score = 0.0;
    for i in 0..distr.nrows() {
        let mut row_sum = 0.0;
        for j in 0..distr.ncols() {
            let v = distr[(i, j)];
            row_sum += v;
            score += (prior - v) * dirichlet_distr[(i, j)];
            score += ln_gamma(v) - ln_gamma(prior);
        }
        score += ln_gamma(prior * size) - ln_gamma(row_sum);
    }
    score
}

/// Output of the E-step over one block of rows
struct EStepBlock {
    doc_topic: Vec<Vec<f64>>,
    suff_stats: Option<Mat<f64>>,
}

///////////
// Model //
///////////

/// Latent Dirichlet Allocation fitted with online variational Bayes
///
/// Rows of the input matrices are units ("documents"), columns are features
/// ("words"). The E-step runs in parallel on the current rayon pool.
///
/// ### Fields
///
/// * `params` - Hyper-parameters.
/// * `n_features` - Number of features M.
/// * `components` - Variational factor-feature parameters, K x M.
/// * `exp_dirichlet_component` - `exp(E[log beta])`, K x M, kept in sync
///   with `components`.
/// * `n_batch_iter` - Number of mini-batch updates so far (starts at 1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnlineLda {
    pub params: OnlineLdaParams,
    pub n_features: usize,
    #[serde(with = "crate::utils::mat_serde")]
    pub components: Mat<f64>,
    #[serde(with = "crate::utils::mat_serde")]
    exp_dirichlet_component: Mat<f64>,
    pub n_batch_iter: usize,
}

impl OnlineLda {
    /// Generate a freshly initialised model
    ///
    /// ### Params
    ///
    /// * `params` - Hyper-parameters.
    /// * `n_features` - Number of features M.
    pub fn new(params: OnlineLdaParams, n_features: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(params.seed);
        // shape and scale are positive constants
        let gamma = Gamma::new(INIT_GAMMA_SHAPE, INIT_GAMMA_SCALE).unwrap();
        let mut components = Mat::<f64>::zeros(params.n_components, n_features);
        for i in 0..params.n_components {
            for j in 0..n_features {
                components[(i, j)] = gamma.sample(&mut rng);
            }
        }
        let exp_dirichlet_component = Self::exp_dirichlet(&components);

        Self {
            params,
            n_features,
            components,
            exp_dirichlet_component,
            n_batch_iter: 1,
        }
    }

    /// Number of factors
    pub fn n_components(&self) -> usize {
        self.params.n_components
    }

    fn exp_dirichlet(components: &Mat<f64>) -> Mat<f64> {
        let mut res = dirichlet_expectation_rows(components);
        for i in 0..res.nrows() {
            for j in 0..res.ncols() {
                res[(i, j)] = res[(i, j)].exp();
            }
        }
        res
    }

    /// Variational update of one unit
    ///
    /// ### Params
    ///
    /// * `ids` - Feature indices of the unit.
    /// * `cnts` - Values of the unit.
    /// * `doc_topic` - Initial variational parameters; updated in place.
    ///
    /// ### Returns
    ///
    /// `exp(E[log theta])` at convergence
    fn update_doc(&self, ids: &[usize], cnts: &[f64], doc_topic: &mut [f64]) -> Vec<f64> {
        let k = self.params.n_components;
        let ew = &self.exp_dirichlet_component;

        let mut exp_doc = vec![0.0; k];
        dirichlet_expectation(doc_topic, &mut exp_doc);
        exp_doc.iter_mut().for_each(|v| *v = v.exp());

        let mut norm_phi = vec![0.0; ids.len()];
        let mut last = vec![0.0; k];

        for _ in 0..self.params.max_doc_update_iter {
            last.copy_from_slice(doc_topic);

            for (n, &id) in ids.iter().enumerate() {
                norm_phi[n] = (0..k).map(|t| exp_doc[t] * ew[(t, id)]).sum::<f64>() + EPS;
            }
            for t in 0..k {
                let dot: f64 = ids
                    .iter()
                    .zip(cnts)
                    .zip(&norm_phi)
                    .map(|((&id, &c), &np)| c / np * ew[(t, id)])
                    .sum();
                doc_topic[t] = exp_doc[t] * dot + self.params.doc_topic_prior;
            }

            dirichlet_expectation(doc_topic, &mut exp_doc);
            exp_doc.iter_mut().for_each(|v| *v = v.exp());

            let mean_change = last
                .iter()
                .zip(doc_topic.iter())
                .map(|(a, b)| (a - b).abs())
                .sum::<f64>()
                / k as f64;
            if mean_change < self.params.mean_change_tol {
                break;
            }
        }

        exp_doc
    }

    /// E-step over a CSR matrix
    ///
    /// ### Params
    ///
    /// * `x` - CSR matrix, units x features.
    /// * `cal_sstats` - Shall the sufficient statistics be computed.
    /// * `init` - Initial variational parameters (n x K). `None` starts all
    ///   units from ones.
    ///
    /// ### Returns
    ///
    /// Tuple of the unnormalised unit-factor parameters (n x K) and the
    /// optional sufficient statistics (K x M)
    fn e_step(
        &self,
        x: &CompressedSparseData<f64>,
        cal_sstats: bool,
        init: Option<&Mat<f64>>,
    ) -> (Mat<f64>, Option<Mat<f64>>) {
        assert_eq!(x.cs_type, CompressedSparseFormat::Csr);
        assert_eq!(
            x.ncols(),
            self.n_features,
            "Matrix has {} features, the model {}",
            x.ncols(),
            self.n_features
        );
        let k = self.params.n_components;
        let n = x.nrows();
        let slices = gen_even_slices(n, rayon::current_num_threads());

        let blocks: Vec<EStepBlock> = slices
            .into_par_iter()
            .map(|range| {
                let mut suff_stats = cal_sstats.then(|| Mat::<f64>::zeros(k, self.n_features));
                let mut doc_topic = Vec::with_capacity(range.len());
                for d in range {
                    let (ids, cnts) = x.outer_slice(d);
                    let mut gamma_d: Vec<f64> = match init {
                        Some(m) => (0..k).map(|t| m[(d, t)]).collect(),
                        None => vec![1.0; k],
                    };
                    let exp_doc = self.update_doc(ids, cnts, &mut gamma_d);

                    if let Some(ss) = suff_stats.as_mut() {
                        for (&id, &c) in ids.iter().zip(cnts) {
                            let norm_phi = (0..k)
                                .map(|t| exp_doc[t] * self.exp_dirichlet_component[(t, id)])
                                .sum::<f64>()
                                + EPS;
                            for t in 0..k {
                                ss[(t, id)] += exp_doc[t] * c / norm_phi;
                            }
                        }
                    }
                    doc_topic.push(gamma_d);
                }
                EStepBlock {
                    doc_topic,
                    suff_stats,
                }
            })
            .collect();

        let mut doc_topic = Mat::<f64>::zeros(n, k);
        let mut suff_stats = cal_sstats.then(|| Mat::<f64>::zeros(k, self.n_features));
        let mut row = 0_usize;
        for block in blocks {
            for gamma_d in block.doc_topic {
                for t in 0..k {
                    doc_topic[(row, t)] = gamma_d[t];
                }
                row += 1;
            }
            if let (Some(total), Some(part)) = (suff_stats.as_mut(), block.suff_stats) {
                for t in 0..k {
                    for j in 0..self.n_features {
                        total[(t, j)] += part[(t, j)];
                    }
                }
            }
        }

        if let Some(ss) = suff_stats.as_mut() {
            for t in 0..k {
                for j in 0..self.n_features {
                    ss[(t, j)] *= self.exp_dirichlet_component[(t, j)];
                }
            }
        }

        (doc_topic, suff_stats)
    }

    /// One online update from a mini-batch
    fn em_step(&mut self, x: &CompressedSparseData<f64>) {
        let n = x.nrows();
        let k = self.params.n_components;
        let mut rng = StdRng::seed_from_u64(
            self.params
                .seed
                .wrapping_add((self.n_batch_iter as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        );
        // shape and scale are positive constants
        let gamma = Gamma::new(INIT_GAMMA_SHAPE, INIT_GAMMA_SCALE).unwrap();
        let mut init = Mat::<f64>::zeros(n, k);
        for i in 0..n {
            for t in 0..k {
                init[(i, t)] = gamma.sample(&mut rng);
            }
        }

        let (_, suff_stats) = self.e_step(x, true, Some(&init));
        let Some(suff_stats) = suff_stats else {
            return;
        };

        let weight = (self.params.learning_offset + self.n_batch_iter as f64)
            .powf(-self.params.learning_decay);
        let doc_ratio = self.params.total_samples / n as f64;
        for t in 0..k {
            for j in 0..self.n_features {
                self.components[(t, j)] = (1.0 - weight) * self.components[(t, j)]
                    + weight * (self.params.topic_word_prior + doc_ratio * suff_stats[(t, j)]);
            }
        }
        self.exp_dirichlet_component = Self::exp_dirichlet(&self.components);
        self.n_batch_iter += 1;
    }

    /// Incrementally update the model with a matrix of units
    ///
    /// The rows are processed in consecutive mini-batches of
    /// `params.batch_size` rows. An empty matrix leaves the model untouched.
    ///
    /// ### Params
    ///
    /// * `x` - CSR matrix, units x features (normalised values).
    pub fn partial_fit(&mut self, x: &CompressedSparseData<f64>) {
        let n = x.nrows();
        let mut start = 0_usize;
        while start < n {
            let end = (start + self.params.batch_size).min(n);
            let rows: Vec<usize> = (start..end).collect();
            let block = x.select_rows(&rows);
            self.em_step(&block);
            start = end;
        }
    }

    /// Unit-factor mixtures of the rows of `x`
    ///
    /// ### Params
    ///
    /// * `x` - CSR matrix, units x features.
    ///
    /// ### Returns
    ///
    /// Matrix of shape n x K; every row sums to 1
    pub fn transform(&self, x: &CompressedSparseData<f64>) -> Mat<f64> {
        let (mut doc_topic, _) = self.e_step(x, false, None);
        for i in 0..doc_topic.nrows() {
            let total: f64 = (0..doc_topic.ncols()).map(|t| doc_topic[(i, t)]).sum();
            for t in 0..doc_topic.ncols() {
                doc_topic[(i, t)] /= total;
            }
        }
        doc_topic
    }

    /// Approximate log-likelihood (variational bound) of `x`
    ///
    /// Divide by the number of rows for a per-unit score.
    ///
    /// ### Params
    ///
    /// * `x` - CSR matrix, units x features.
    ///
    /// ### Returns
    ///
    /// The bound
    pub fn score(&self, x: &CompressedSparseData<f64>) -> f64 {
        let (doc_topic, _) = self.e_step(x, false, None);
        let dirichlet_doc_topic = dirichlet_expectation_rows(&doc_topic);
        let dirichlet_component = dirichlet_expectation_rows(&self.components);
        let k = self.params.n_components;

        let word_score: f64 = (0..x.nrows())
            .into_par_iter()
            .map(|d| {
                let (ids, cnts) = x.outer_slice(d);
                let mut temp = vec![0.0; k];
                let mut s = 0.0;
                for (&id, &c) in ids.iter().zip(cnts) {
                    for (t, v) in temp.iter_mut().enumerate() {
                        *v = dirichlet_doc_topic[(d, t)] + dirichlet_component[(t, id)];
                    }
                    s += c * log_sum_exp(&temp);
                }
                s
            })
            .sum();

        word_score
            + dirichlet_loglikelihood(
                self.params.doc_topic_prior,
                &doc_topic,
                &dirichlet_doc_topic,
            )
            + dirichlet_loglikelihood(
                self.params.topic_word_prior,
                &self.components,
                &dirichlet_component,
            )
    }
}

///////////
// Tests //
///////////
