use rustc_hash::FxHashMap;
use std::time::Instant;

use crate::core::data::dge_io::DgeRecord;
use crate::core::data::sparse_structures::*;
use crate::utils::errors::{LdaError, LdaResult};

/////////////////////
// Data structures //
/////////////////////

/// A feature retained in the corpus
///
/// ### Fields
///
/// * `id` - Feature identifier.
/// * `weight` - Total count of the feature over all units before any unit
///   filtering.
/// * `index` - Column index in every matrix built from this corpus.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureInfo {
    pub id: String,
    pub weight: f64,
    pub index: usize,
}

/// A unit retained in the corpus
///
/// ### Fields
///
/// * `id` - Unit identifier.
/// * `index` - Index in order of first appearance, assigned before the
///   count filters.
/// * `total` - Total count over the retained features.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitInfo {
    pub id: String,
    pub index: usize,
    pub total: u64,
}

/// The in-memory corpus
///
/// ### Fields
///
/// * `features` - Retained features, ordered by column index.
/// * `units` - Retained units, ordered by row.
/// * `matrix` - CSR unit x feature count matrix.
/// * `feature_dict` - Feature id to column index.
/// * `unit_dict` - Unit id to row index.
#[derive(Debug, Clone)]
pub struct DgeCorpus {
    pub features: Vec<FeatureInfo>,
    pub units: Vec<UnitInfo>,
    pub matrix: CompressedSparseData<u32>,
    pub feature_dict: FxHashMap<String, usize>,
    pub unit_dict: FxHashMap<String, usize>,
}

impl DgeCorpus {
    /// Feature weights in column order
    pub fn feature_weights(&self) -> Vec<f64> {
        self.features.iter().map(|f| f.weight).collect()
    }

    /// Feature identifiers in column order
    pub fn feature_ids(&self) -> Vec<String> {
        self.features.iter().map(|f| f.id.clone()).collect()
    }
}

/////////////
// Builder //
/////////////

/// Builds the unit x feature matrix from long-format records
///
/// ### Fields
///
/// * `min_ct_per_unit` - Units with a lower total are dropped.
/// * `min_ct_per_feature` - Features with a lower total over the retained
///   units are dropped.
#[derive(Debug, Clone, Copy)]
pub struct SparseMatrixBuilder {
    pub min_ct_per_unit: u64,
    pub min_ct_per_feature: u64,
}

impl SparseMatrixBuilder {
    /// Generate a new builder
    pub fn new(min_ct_per_unit: u64, min_ct_per_feature: u64) -> Self {
        Self {
            min_ct_per_unit,
            min_ct_per_feature,
        }
    }

    /// Build the corpus
    ///
    /// Counts of repeated (unit, feature) pairs are summed. Records of one
    /// unit do not need to be contiguous here. Features are ordered by
    /// identifier, units by first appearance.
    ///
    /// ### Params
    ///
    /// * `records` - The long-format records.
    ///
    /// ### Returns
    ///
    /// The `DgeCorpus`, or `LdaError::EmptyCorpus` if no unit or no feature
    /// passes the thresholds.
    pub fn build<I>(&self, records: I) -> LdaResult<DgeCorpus>
    where
        I: IntoIterator<Item = LdaResult<DgeRecord>>,
    {
        let start = Instant::now();

        let mut unit_lookup: FxHashMap<String, usize> = FxHashMap::default();
        let mut unit_ids: Vec<String> = Vec::new();
        let mut unit_counts: Vec<FxHashMap<usize, u64>> = Vec::new();

        let mut feature_lookup: FxHashMap<String, usize> = FxHashMap::default();
        let mut feature_ids: Vec<String> = Vec::new();
        let mut feature_weight: Vec<u64> = Vec::new();

        for record in records {
            let record = record?;
            let u = match unit_lookup.get(&record.unit) {
                Some(&u) => u,
                None => {
                    let u = unit_ids.len();
                    unit_lookup.insert(record.unit.clone(), u);
                    unit_ids.push(record.unit);
                    unit_counts.push(FxHashMap::default());
                    u
                }
            };
            let f = match feature_lookup.get(&record.feature) {
                Some(&f) => f,
                None => {
                    let f = feature_ids.len();
                    feature_lookup.insert(record.feature.clone(), f);
                    feature_ids.push(record.feature);
                    feature_weight.push(0);
                    f
                }
            };
            *unit_counts[u].entry(f).or_insert(0) += record.count as u64;
            feature_weight[f] += record.count as u64;
        }

        // first unit filter on raw totals
        let unit_pass: Vec<bool> = unit_counts
            .iter()
            .map(|c| c.values().sum::<u64>() >= self.min_ct_per_unit)
            .collect();

        let mut feature_total = vec![0_u64; feature_ids.len()];
        for (counts, _) in unit_counts.iter().zip(&unit_pass).filter(|(_, p)| **p) {
            for (&f, &c) in counts {
                feature_total[f] += c;
            }
        }

        let mut kept_features: Vec<usize> = (0..feature_ids.len())
            .filter(|&f| feature_total[f] >= self.min_ct_per_feature && feature_total[f] > 0)
            .collect();
        kept_features.sort_by(|&a, &b| feature_ids[a].cmp(&feature_ids[b]));

        let mut old_to_new: Vec<Option<usize>> = vec![None; feature_ids.len()];
        for (new, &old) in kept_features.iter().enumerate() {
            old_to_new[old] = Some(new);
        }

        // second unit filter on totals over the retained features
        let mut units = Vec::new();
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = vec![0_usize];

        for (u, counts) in unit_counts.iter().enumerate() {
            if !unit_pass[u] {
                continue;
            }
            let mut row: Vec<(usize, u32)> = Vec::with_capacity(counts.len());
            for (&f, &c) in counts {
                let Some(j) = old_to_new[f] else { continue };
                let c = u32::try_from(c).map_err(|_| LdaError::CountOverflow {
                    unit: unit_ids[u].clone(),
                    feature: feature_ids[f].clone(),
                })?;
                row.push((j, c));
            }
            let total: u64 = row.iter().map(|&(_, c)| c as u64).sum();
            if total < self.min_ct_per_unit || row.is_empty() {
                continue;
            }
            row.sort_unstable_by_key(|&(j, _)| j);
            for (j, c) in row {
                indices.push(j);
                data.push(c);
            }
            indptr.push(data.len());
            units.push(UnitInfo {
                id: unit_ids[u].clone(),
                index: u,
                total,
            });
        }

        if units.is_empty() || kept_features.is_empty() {
            return Err(LdaError::EmptyCorpus {
                n_units: units.len(),
                n_features: kept_features.len(),
            });
        }

        let features: Vec<FeatureInfo> = kept_features
            .iter()
            .enumerate()
            .map(|(new, &old)| FeatureInfo {
                id: feature_ids[old].clone(),
                weight: feature_weight[old] as f64,
                index: new,
            })
            .collect();

        let feature_dict = features
            .iter()
            .map(|f| (f.id.clone(), f.index))
            .collect::<FxHashMap<String, usize>>();
        let unit_dict = units
            .iter()
            .enumerate()
            .map(|(row, u)| (u.id.clone(), row))
            .collect::<FxHashMap<String, usize>>();

        let matrix = CompressedSparseData::new_csr(
            &data,
            &indices,
            &indptr,
            (units.len(), features.len()),
        );

        log::info!(
            "Built count matrix: {} units x {} features ({} non-zero) in {:.2?}",
            units.len(),
            features.len(),
            matrix.get_nnz(),
            start.elapsed()
        );

        Ok(DgeCorpus {
            features,
            units,
            matrix,
            feature_dict,
            unit_dict,
        })
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    fn scenario_records() -> Vec<LdaResult<DgeRecord>> {
        // [[5,0,2,0],[0,6,0,1],[3,0,0,4]]
        vec![
            Ok(DgeRecord::new("u1", "f0", 5)),
            Ok(DgeRecord::new("u1", "f2", 2)),
            Ok(DgeRecord::new("u2", "f1", 6)),
            Ok(DgeRecord::new("u2", "f3", 1)),
            Ok(DgeRecord::new("u3", "f0", 3)),
            Ok(DgeRecord::new("u3", "f3", 4)),
        ]
    }

    #[test]
    fn test_scenario_keeps_everything() {
        let corpus = SparseMatrixBuilder::new(1, 1)
            .build(scenario_records())
            .unwrap();

        assert_eq!(corpus.matrix.shape(), (3, 4));
        assert_eq!(
            corpus.matrix.to_dense_matrix(),
            mat![
                [5.0, 0.0, 2.0, 0.0],
                [0.0, 6.0, 0.0, 1.0],
                [3.0, 0.0, 0.0, 4.0]
            ]
        );
        assert_eq!(corpus.feature_weights(), vec![8.0, 6.0, 2.0, 5.0]);
        assert_eq!(corpus.unit_dict["u3"], 2);
        assert_eq!(corpus.feature_dict["f3"], 3);
    }

    #[test]
    fn test_scenario_unit_min_empties_corpus() {
        let res = SparseMatrixBuilder::new(10, 1).build(scenario_records());
        assert!(matches!(res, Err(LdaError::EmptyCorpus { n_units: 0, .. })));
    }

    #[test]
    fn test_feature_filter_and_row_minimum() {
        // f2 (total 2) is dropped, which takes u1 below the unit minimum
        let corpus = SparseMatrixBuilder::new(7, 3)
            .build(scenario_records())
            .unwrap();

        assert_eq!(corpus.feature_ids(), vec!["f0", "f1", "f3"]);
        assert_eq!(
            corpus.units.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(),
            vec!["u2", "u3"]
        );
        // unit indices are assigned before filtering
        assert_eq!(corpus.units[0].index, 1);
        for s in corpus.matrix.outer_sums() {
            assert!(s >= 7.0);
        }
    }

    #[test]
    fn test_duplicate_pairs_are_summed() {
        let records = vec![
            Ok(DgeRecord::new("u1", "a", 2)),
            Ok(DgeRecord::new("u1", "a", 3)),
            Ok(DgeRecord::new("u1", "b", 1)),
        ];
        let corpus = SparseMatrixBuilder::new(1, 1).build(records).unwrap();
        assert_eq!(corpus.matrix.data, vec![5, 1]);
        assert_eq!(corpus.units[0].total, 6);
    }

    #[test]
    fn test_summed_count_beyond_u32_is_an_error() {
        let records = vec![
            Ok(DgeRecord::new("u1", "g1", u32::MAX)),
            Ok(DgeRecord::new("u1", "g1", 1)),
            Ok(DgeRecord::new("u2", "g1", 4)),
        ];
        let res = SparseMatrixBuilder::new(1, 1).build(records);
        match res {
            Err(LdaError::CountOverflow { unit, feature }) => {
                assert_eq!(unit, "u1");
                assert_eq!(feature, "g1");
            }
            other => panic!("expected CountOverflow, got {:?}", other.map(|c| c.units.len())),
        }
    }
}
