use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufRead, Write};
use std::path::Path;

use spatial_lda::core::data::dge_io::open_maybe_gz;
use spatial_lda::core::data::output_io::{load_bincode, load_fitted_model};
use spatial_lda::core::data::sparse_structures::CompressedSparseData;
use spatial_lda::core::topic::model_selection::CandidateResult;
use spatial_lda::utils::config::NormalisationMode;
use spatial_lda::{run_lda_model_selection, LdaError, TopicFitConfig};
use std::collections::BTreeMap;

/// 40 units in two spatial blocks ("aa", "bb") expressing two gene programs
fn write_input(path: &Path) {
    let file = File::create(path).unwrap();
    let mut gz = GzEncoder::new(file, Compression::default());
    writeln!(gz, "random_index\tGENE\tgn\tX\tY").unwrap();
    for u in 0..40 {
        let prefix = if u < 20 { "aa" } else { "bb" };
        let unit = format!("{}{:03}", prefix, u);
        let genes: &[&str] = if u % 2 == 0 {
            &["g1", "g2", "g3"]
        } else {
            &["g4", "g5", "g6"]
        };
        for (j, g) in genes.iter().enumerate() {
            let count = 3 + (u + j) % 4;
            writeln!(gz, "{}\t{}\t{}\t{}.0\t{}.5", unit, g, count, u, j).unwrap();
        }
        // a rare gene removed by the feature threshold
        if u == 7 {
            writeln!(gz, "{}\trare\t1\t{}.0\t0.5", unit, u).unwrap();
        }
    }
    gz.finish().unwrap();
}

fn config(input: &Path, output: &str) -> TopicFitConfig {
    let mut cfg = TopicFitConfig::new(input, output, 2);
    cfg.n_repeats = 2;
    cfg.epoch_init = 2;
    cfg.epoch = 1.0;
    cfg.min_ct_per_unit = 5;
    cfg.min_ct_per_feature = 5;
    cfg.batch_size = 8;
    cfg.top_markers = 3;
    cfg.score_feature_min = 0.0;
    cfg.normalisation = NormalisationMode::L1Log;
    cfg.columns.unit_attr = vec!["x".to_string(), "y".to_string()];
    cfg
}

fn read_lines(path: &Path) -> Vec<String> {
    open_maybe_gz(path)
        .unwrap()
        .lines()
        .map(|l| l.unwrap())
        .collect()
}

#[test]
fn test_full_pipeline_writes_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.tsv.gz");
    write_input(&input);
    let prefix = dir.path().join("run");
    let prefix = prefix.to_str().unwrap();

    let summary = run_lda_model_selection(config(&input, prefix)).unwrap();

    assert_eq!(summary.n_units, 40);
    assert_eq!(summary.n_features, 6);
    assert_eq!(summary.aggregates.len(), 2);
    assert_eq!(summary.outputs.len(), 6);
    for path in &summary.outputs {
        assert!(path.exists(), "{} missing", path.display());
        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        assert!(!Path::new(&partial).exists());
    }

    let coherence = read_lines(Path::new(&format!("{}.coherence.tsv", prefix)));
    assert_eq!(coherence[0], "R\tK\tScore0\tScore");
    assert_eq!(coherence.len(), 1 + 2 * 2);

    let fit = read_lines(Path::new(&format!("{}.fit_result.tsv.gz", prefix)));
    assert_eq!(fit[0], "unit\tgn\tx\ty\ttopK\ttopP\t0\t1");
    assert_eq!(fit.len(), 41);
    assert!(fit[1].starts_with("aa000\t"));

    let post = read_lines(Path::new(&format!("{}.posterior.count.tsv.gz", prefix)));
    assert_eq!(post[0], "gene\t0\t1");
    assert_eq!(post.len(), 7);
    assert!(post.iter().all(|l| !l.starts_with("rare")));

    let matrix = read_lines(Path::new(&format!("{}.model_matrix.tsv.gz", prefix)));
    assert_eq!(matrix.len(), 7);

    let candidates: BTreeMap<usize, CandidateResult> =
        load_bincode(format!("{}.model_selection_candidates.p", prefix)).unwrap();
    assert_eq!(candidates.len(), 2);
    assert!(candidates.values().all(|c| c.coherence.len() == 2));
}

#[test]
fn test_fitted_model_can_be_reloaded() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.tsv.gz");
    write_input(&input);
    let prefix = dir.path().join("run");
    let prefix = prefix.to_str().unwrap();
    run_lda_model_selection(config(&input, prefix)).unwrap();

    let fitted = load_fitted_model(format!("{}.model.p", prefix)).unwrap();
    assert_eq!(fitted.feature_names, vec!["g1", "g2", "g3", "g4", "g5", "g6"]);
    assert_eq!(fitted.normaliser.mode, NormalisationMode::L1Log);
    assert!((fitted.normaliser.unit_sum_mean - 15.0).abs() < 3.0);

    let dict = fitted.feature_dict();
    let counts =
        CompressedSparseData::new_csr(&[4_u32, 5], &[dict["g1"], dict["g2"]], &[0, 2], (1, 6));
    let theta = fitted.transform_counts(&counts);
    assert!((theta[(0, 0)] + theta[(0, 1)] - 1.0).abs() < 1e-10);
}

#[test]
fn test_missing_column_is_schema_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.tsv.gz");
    write_input(&input);
    let mut cfg = config(&input, dir.path().join("run").to_str().unwrap());
    cfg.columns.count = "umi".to_string();

    let err = run_lda_model_selection(cfg).unwrap_err();
    assert!(matches!(err, LdaError::Schema { .. }));
}

#[test]
fn test_thresholds_too_high_is_empty_corpus() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.tsv.gz");
    write_input(&input);
    let mut cfg = config(&input, dir.path().join("run").to_str().unwrap());
    cfg.min_ct_per_unit = 1000;

    let err = run_lda_model_selection(cfg).unwrap_err();
    assert!(matches!(err, LdaError::EmptyCorpus { .. }));
}
