use rustc_hash::{FxHashMap, FxHashSet};

use crate::core::data::dge_io::DgeRecord;
use crate::core::data::sparse_structures::*;
use crate::utils::errors::{LdaError, LdaResult};

/////////////////////
// Data structures //
/////////////////////

/// Externally visible state of the `UnitLoader`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Pulling records; no batch available
    Accumulating,
    /// A batch was materialised by the last `update_batch()` call
    BatchReady,
    /// The source is drained and nothing is pending
    Exhausted,
}

/// Per-unit metadata parallel to the rows of a batch
///
/// ### Fields
///
/// * `unit` - Unit identifier.
/// * `total` - Sum of the counts over features known to the dictionary (the
///   "training key" passthrough).
/// * `attrs` - Passthrough attributes taken from the first record of the
///   unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitMeta {
    pub unit: String,
    pub total: u64,
    pub attrs: Vec<String>,
}

/// One materialised mini-batch
///
/// ### Fields
///
/// * `mtx` - CSR unit x feature counts; columns follow the corpus feature
///   dictionary.
/// * `brc` - Metadata, one entry per row of `mtx`.
#[derive(Debug, Clone)]
pub struct UnitBatch {
    pub mtx: CompressedSparseData<u32>,
    pub brc: Vec<UnitMeta>,
}

/// Records of the unit currently being read
struct OpenUnit {
    unit: String,
    group: String,
    attrs: Vec<String>,
    entries: Vec<(usize, u32)>,
}

/////////////
// Helpers //
/////////////

/// Batch group key of a unit
///
/// The lower-cased first `prefix_len` characters of the identifier. Returns
/// an empty key if grouping is disabled.
///
/// ### Params
///
/// * `unit` - Unit identifier.
/// * `prefix_len` - Prefix length; `0` disables grouping.
pub fn batch_group_key(unit: &str, prefix_len: usize) -> String {
    if prefix_len == 0 {
        return String::new();
    }
    unit.chars().take(prefix_len).collect::<String>().to_lowercase()
}

////////////
// Loader //
////////////

/// Pull-based accumulator of mini-batches over a unit-grouped record stream
///
/// The source has to deliver all records of a unit contiguously. A unit that
/// re-appears within the batch it was closed in is reported as
/// `LdaError::StreamOrderingViolation`; re-appearances across batches cannot
/// be detected and produce duplicate rows.
///
/// Batches end on a unit boundary once at least `target` units were read.
/// With grouping enabled (`batch_id_prefix > 0`) the batch additionally runs
/// to the end of the current batch group, so a group larger than `target`
/// is flushed alone once it is complete.
pub struct UnitLoader<'a, I>
where
    I: Iterator<Item = LdaResult<DgeRecord>>,
{
    source: I,
    feature_dict: &'a FxHashMap<String, usize>,
    n_features: usize,
    min_ct_per_unit: u64,
    batch_id_prefix: usize,
    batch_id_list: Vec<String>,
    batch_id_seen: FxHashSet<String>,
    pending: Option<DgeRecord>,
    state: BatchState,
    batch: Option<UnitBatch>,
    n_units_read: usize,
}

impl<'a, I> UnitLoader<'a, I>
where
    I: Iterator<Item = LdaResult<DgeRecord>>,
{
    /// Generate a new loader
    ///
    /// ### Params
    ///
    /// * `source` - The record stream, grouped by unit.
    /// * `feature_dict` - Feature id to column index of the corpus.
    /// * `min_ct_per_unit` - Minimum total over known features per row.
    /// * `batch_id_prefix` - Prefix length defining batch groups; `0`
    ///   disables grouping.
    pub fn new(
        source: I,
        feature_dict: &'a FxHashMap<String, usize>,
        min_ct_per_unit: u64,
        batch_id_prefix: usize,
    ) -> Self {
        Self {
            source,
            feature_dict,
            n_features: feature_dict.len(),
            min_ct_per_unit,
            batch_id_prefix,
            batch_id_list: Vec::new(),
            batch_id_seen: FxHashSet::default(),
            pending: None,
            state: BatchState::Accumulating,
            batch: None,
            n_units_read: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Distinct batch group keys seen so far, in order of appearance
    ///
    /// Includes the group of a unit that was read ahead to detect the end of
    /// the last batch.
    pub fn batch_id_list(&self) -> &[String] {
        &self.batch_id_list
    }

    /// Number of units consumed from the source so far, filtered or not
    pub fn n_units_read(&self) -> usize {
        self.n_units_read
    }

    /// The batch produced by the last successful `update_batch()`
    pub fn batch(&self) -> Option<&UnitBatch> {
        self.batch.as_ref()
    }

    /// Move the current batch out of the loader
    pub fn take_batch(&mut self) -> Option<UnitBatch> {
        self.batch.take()
    }

    /// Accumulate the next mini-batch
    ///
    /// ### Params
    ///
    /// * `target` - Target number of units in the batch.
    ///
    /// ### Returns
    ///
    /// `true` if a batch is available via `batch()`, `false` once the source
    /// is exhausted. The batch may have zero rows if every unit read for it
    /// fell below the count threshold.
    pub fn update_batch(&mut self, target: usize) -> LdaResult<bool> {
        self.batch = None;
        if self.state == BatchState::Exhausted {
            return Ok(false);
        }
        self.state = BatchState::Accumulating;

        let mut data: Vec<u32> = Vec::new();
        let mut indices: Vec<usize> = Vec::new();
        let mut indptr: Vec<usize> = vec![0];
        let mut brc: Vec<UnitMeta> = Vec::new();
        let mut closed: FxHashSet<String> = FxHashSet::default();
        let mut n_units = 0_usize;
        let mut current: Option<OpenUnit> = None;

        loop {
            let record = match self.pending.take() {
                Some(r) => Some(r),
                None => self.source.next().transpose()?,
            };

            let Some(record) = record else {
                if let Some(open) = current.take() {
                    n_units += 1;
                    self.close_unit(open, &mut data, &mut indices, &mut indptr, &mut brc)?;
                }
                break;
            };

            if let Some(open) = current.as_mut() {
                if open.unit == record.unit {
                    self.push_record(open, record);
                    continue;
                }
            }

            // the record starts a new unit
            let group = batch_group_key(&record.unit, self.batch_id_prefix);
            if !group.is_empty() && self.batch_id_seen.insert(group.clone()) {
                self.batch_id_list.push(group.clone());
            }

            if let Some(open) = current.take() {
                n_units += 1;
                let boundary = self.batch_id_prefix == 0 || open.group != group;
                closed.insert(open.unit.clone());
                self.close_unit(open, &mut data, &mut indices, &mut indptr, &mut brc)?;
                if n_units >= target && boundary {
                    self.pending = Some(record);
                    break;
                }
            }

            if closed.contains(&record.unit) {
                return Err(LdaError::StreamOrderingViolation { unit: record.unit });
            }

            let mut open = OpenUnit {
                unit: record.unit.clone(),
                group,
                attrs: record.attrs.clone(),
                entries: Vec::new(),
            };
            self.push_record(&mut open, record);
            current = Some(open);
        }

        if n_units == 0 {
            self.state = BatchState::Exhausted;
            return Ok(false);
        }

        self.n_units_read += n_units;
        let mtx =
            CompressedSparseData::new_csr(&data, &indices, &indptr, (brc.len(), self.n_features));
        self.batch = Some(UnitBatch { mtx, brc });
        self.state = BatchState::BatchReady;

        Ok(true)
    }

    fn push_record(&self, open: &mut OpenUnit, record: DgeRecord) {
        if let Some(&j) = self.feature_dict.get(&record.feature) {
            open.entries.push((j, record.count));
        }
    }

    fn close_unit(
        &self,
        mut open: OpenUnit,
        data: &mut Vec<u32>,
        indices: &mut Vec<usize>,
        indptr: &mut Vec<usize>,
        brc: &mut Vec<UnitMeta>,
    ) -> LdaResult<()> {
        open.entries.sort_unstable_by_key(|&(j, _)| j);
        let mut merged: Vec<(usize, u32)> = Vec::with_capacity(open.entries.len());
        for (j, c) in open.entries {
            match merged.last_mut() {
                Some((last_j, last_c)) if *last_j == j => {
                    *last_c = last_c
                        .checked_add(c)
                        .ok_or_else(|| LdaError::CountOverflow {
                            unit: open.unit.clone(),
                            feature: self.feature_name(j),
                        })?;
                }
                _ => merged.push((j, c)),
            }
        }

        let total: u64 = merged.iter().map(|&(_, c)| c as u64).sum();
        if merged.is_empty() || total < self.min_ct_per_unit {
            return Ok(());
        }

        for (j, c) in merged {
            indices.push(j);
            data.push(c);
        }
        indptr.push(data.len());
        brc.push(UnitMeta {
            unit: open.unit,
            total,
            attrs: open.attrs,
        });
        Ok(())
    }

    /// Reverse lookup of a column index; only used for error messages
    fn feature_name(&self, j: usize) -> String {
        self.feature_dict
            .iter()
            .find(|&(_, &v)| v == j)
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| j.to_string())
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::sparse_builder::SparseMatrixBuilder;

    fn dict(features: &[&str]) -> FxHashMap<String, usize> {
        features
            .iter()
            .enumerate()
            .map(|(i, f)| (f.to_string(), i))
            .collect()
    }

    fn records(spec: &[(&str, &str, u32)]) -> Vec<LdaResult<DgeRecord>> {
        spec.iter()
            .map(|&(u, f, c)| Ok(DgeRecord::new(u, f, c)))
            .collect()
    }

    type VecLoader<'a> = UnitLoader<'a, std::vec::IntoIter<LdaResult<DgeRecord>>>;

    fn drain(loader: &mut VecLoader<'_>, target: usize) -> Vec<Vec<String>> {
        let mut res = Vec::new();
        while loader.update_batch(target).unwrap() {
            let batch = loader.take_batch().unwrap();
            res.push(batch.brc.into_iter().map(|m| m.unit).collect());
        }
        res
    }

    #[test]
    fn test_batch_group_key() {
        assert_eq!(batch_group_key("ABcd", 2), "ab");
        assert_eq!(batch_group_key("A", 3), "a");
        assert_eq!(batch_group_key("ABcd", 0), "");
    }

    #[test]
    fn test_ungrouped_flushes_at_target() {
        let d = dict(&["g1", "g2"]);
        let recs = records(&[
            ("u1", "g1", 1),
            ("u2", "g1", 1),
            ("u2", "g2", 1),
            ("u3", "g2", 1),
            ("u4", "g1", 1),
            ("u5", "g1", 1),
        ]);
        let mut loader = UnitLoader::new(recs.into_iter(), &d, 1, 0);

        let batches = drain(&mut loader, 2);

        assert_eq!(
            batches,
            vec![vec!["u1", "u2"], vec!["u3", "u4"], vec!["u5"]]
        );
        assert_eq!(loader.state(), BatchState::Exhausted);
        assert!(loader.batch_id_list().is_empty());
        assert_eq!(loader.n_units_read(), 5);
    }

    #[test]
    fn test_grouped_batches_do_not_split_groups() {
        let d = dict(&["g1"]);
        let recs = records(&[
            ("AAu1", "g1", 1),
            ("AAu2", "g1", 1),
            ("AAu3", "g1", 1),
            ("ABu1", "g1", 1),
            ("ACu1", "g1", 1),
            ("ACu2", "g1", 1),
        ]);
        let mut loader = UnitLoader::new(recs.into_iter(), &d, 1, 2);

        assert!(loader.update_batch(2).unwrap());
        let first: Vec<String> =
            loader.batch().unwrap().brc.iter().map(|m| m.unit.clone()).collect();
        // group "aa" exceeds the target and is flushed alone
        assert_eq!(first, vec!["AAu1", "AAu2", "AAu3"]);
        assert_eq!(loader.batch_id_list(), &["aa".to_string(), "ab".to_string()]);

        assert!(loader.update_batch(2).unwrap());
        let second: Vec<String> =
            loader.batch().unwrap().brc.iter().map(|m| m.unit.clone()).collect();
        assert_eq!(second, vec!["ABu1", "ACu1", "ACu2"]);

        assert!(!loader.update_batch(2).unwrap());
        assert_eq!(loader.batch_id_list().len(), 3);
    }

    #[test]
    fn test_unknown_features_and_threshold() {
        let d = dict(&["g1", "g2"]);
        let recs = records(&[
            ("u1", "g1", 2),
            ("u1", "zz", 10),
            ("u2", "g2", 3),
            ("u2", "g1", 1),
            ("u2", "g2", 1),
        ]);
        let mut loader = UnitLoader::new(recs.into_iter(), &d, 3, 0);

        assert!(loader.update_batch(10).unwrap());
        let batch = loader.take_batch().unwrap();

        // u1 only has 2 counts on known features
        assert_eq!(batch.brc.len(), 1);
        assert_eq!(batch.brc[0].unit, "u2");
        assert_eq!(batch.brc[0].total, 5);
        assert_eq!(batch.mtx.indices, vec![0, 1]);
        assert_eq!(batch.mtx.data, vec![1, 4]);
        assert_eq!(batch.mtx.shape(), (1, 2));
        assert_eq!(loader.n_units_read(), 2);
    }

    #[test]
    fn test_non_contiguous_unit_is_reported() {
        let d = dict(&["g1"]);
        let recs = records(&[("u1", "g1", 1), ("u2", "g1", 1), ("u1", "g1", 1)]);
        let mut loader = UnitLoader::new(recs.into_iter(), &d, 1, 0);

        let res = loader.update_batch(10);

        assert!(matches!(
            res,
            Err(LdaError::StreamOrderingViolation { ref unit }) if unit == "u1"
        ));
    }

    #[test]
    fn test_batches_reproduce_full_build() {
        let spec: Vec<(String, String, u32)> = (0..40)
            .flat_map(|u| {
                (0..5).filter_map(move |f| {
                    let c = ((u * 7 + f * 3) % 5) as u32;
                    let unit = format!("{}{:02}", ["ab", "cd", "ef"][u % 3], u);
                    (c > 0).then(|| (unit, format!("g{}", f), c))
                })
            })
            .collect();
        let mut sorted = spec.clone();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let recs = || -> Vec<LdaResult<DgeRecord>> {
            sorted
                .iter()
                .map(|(u, f, c)| Ok(DgeRecord::new(u, f, *c)))
                .collect()
        };

        let corpus = SparseMatrixBuilder::new(5, 1).build(recs()).unwrap();
        let mut loader = UnitLoader::new(recs().into_iter(), &corpus.feature_dict, 5, 2);

        let mut streamed: Vec<String> = Vec::new();
        while loader.update_batch(4).unwrap() {
            let batch = loader.take_batch().unwrap();
            for (row, meta) in batch.brc.iter().enumerate() {
                // same column mapping as the full build
                let full_row = corpus.unit_dict[&meta.unit];
                let (idx_b, val_b) = batch.mtx.outer_slice(row);
                let (idx_f, val_f) = corpus.matrix.outer_slice(full_row);
                assert_eq!(idx_b, idx_f);
                assert_eq!(val_b, val_f);
                assert!(meta.total >= 5);
            }
            streamed.extend(batch.brc.into_iter().map(|m| m.unit));
        }

        let mut expected: Vec<String> = corpus.units.iter().map(|u| u.id.clone()).collect();
        expected.sort();
        let n_streamed = streamed.len();
        streamed.sort();
        streamed.dedup();
        assert_eq!(streamed.len(), n_streamed);
        assert_eq!(streamed, expected);
    }

    #[test]
    fn test_summed_count_beyond_u32_is_an_error() {
        let d = dict(&["g0", "g1"]);
        let recs = records(&[("u1", "g1", u32::MAX), ("u1", "g1", 1), ("u2", "g0", 3)]);
        let mut loader = UnitLoader::new(recs.into_iter(), &d, 1, 0);

        let res = loader.update_batch(10);

        assert!(matches!(
            res,
            Err(LdaError::CountOverflow { ref unit, ref feature })
                if unit == "u1" && feature == "g1"
        ));
    }
}
