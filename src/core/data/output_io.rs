use bincode::config;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use faer::MatRef;

use crate::core::topic::model_selection::CoherenceRow;
use crate::core::topic::refit::FittedModel;
use crate::utils::errors::LdaResult;

/// Buffer size of the output writers
const WRITE_BUFFER: usize = 4 * 1024 * 1024;

/////////////
// Helpers //
/////////////

/// Path the data is written to before the final rename
fn partial_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".partial");
    PathBuf::from(s)
}

fn is_gz(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

enum Sink {
    Plain(BufWriter<File>),
    Gz(GzEncoder<BufWriter<File>>),
}

////////////////////
// Table writing //
////////////////////

/// Tab-separated table writer
///
/// Writes to `<path>.partial`, gzip compressed if `path` ends in `.gz`, and
/// renames to `path` in `finish()`. A writer dropped without `finish()`
/// leaves only the partial file behind.
///
/// ### Fields
///
/// * `sink` - The underlying (compressed) writer.
/// * `partial` - The temporary path.
/// * `path` - The final path.
/// * `n_rows` - Number of data rows written so far.
pub struct TableWriter {
    sink: Sink,
    partial: PathBuf,
    path: PathBuf,
    n_rows: usize,
}

impl TableWriter {
    /// Create the writer and write the header
    ///
    /// ### Params
    ///
    /// * `path` - Final path of the table.
    /// * `header` - Column names.
    pub fn create<P: AsRef<Path>>(path: P, header: &[String]) -> LdaResult<Self> {
        let path = path.as_ref().to_path_buf();
        let partial = partial_path(&path);
        let file = BufWriter::with_capacity(WRITE_BUFFER, File::create(&partial)?);
        let sink = if is_gz(&path) {
            Sink::Gz(GzEncoder::new(file, Compression::default()))
        } else {
            Sink::Plain(file)
        };

        let mut writer = Self {
            sink,
            partial,
            path,
            n_rows: 0,
        };
        writer.write_line(&header.join("\t"))?;
        Ok(writer)
    }

    fn write_line(&mut self, line: &str) -> LdaResult<()> {
        let w: &mut dyn Write = match &mut self.sink {
            Sink::Plain(w) => w,
            Sink::Gz(w) => w,
        };
        w.write_all(line.as_bytes())?;
        w.write_all(b"\n")?;
        Ok(())
    }

    /// Append one row
    pub fn write_row(&mut self, fields: &[String]) -> LdaResult<()> {
        self.write_line(&fields.join("\t"))?;
        self.n_rows += 1;
        Ok(())
    }

    /// Number of data rows written so far
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Flush, close and move the table to its final path
    pub fn finish(self) -> LdaResult<PathBuf> {
        let mut file = match self.sink {
            Sink::Plain(w) => w,
            Sink::Gz(w) => w.finish()?,
        };
        file.flush()?;
        drop(file);
        fs::rename(&self.partial, &self.path)?;
        info!("Wrote {}", self.path.display());
        Ok(self.path)
    }
}

/// Write the coherence table with the columns `R K Score0 Score`
///
/// ### Params
///
/// * `path` - Output path.
/// * `rows` - The coherence rows.
pub fn write_coherence_table<P: AsRef<Path>>(path: P, rows: &[CoherenceRow]) -> LdaResult<()> {
    let header: Vec<String> = ["R", "K", "Score0", "Score"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut writer = TableWriter::create(path, &header)?;
    for row in rows {
        writer.write_row(&[
            row.r.to_string(),
            row.k.to_string(),
            row.score0.to_string(),
            row.score.to_string(),
        ])?;
    }
    writer.finish()?;
    Ok(())
}

/// Write a features x factors matrix with one row per feature
///
/// ### Params
///
/// * `path` - Output path.
/// * `feature_column` - Name of the feature column.
/// * `features` - Feature identifiers, one per row of `mat`.
/// * `mat` - The matrix, features x factors.
/// * `fmt` - Formatter of the values.
pub fn write_feature_matrix<P, F>(
    path: P,
    feature_column: &str,
    features: &[String],
    mat: MatRef<f64>,
    fmt: F,
) -> LdaResult<()>
where
    P: AsRef<Path>,
    F: Fn(f64) -> String,
{
    assert_eq!(features.len(), mat.nrows());

    let mut header = vec![feature_column.to_string()];
    header.extend((0..mat.ncols()).map(|k| k.to_string()));
    let mut writer = TableWriter::create(path, &header)?;

    for (i, feature) in features.iter().enumerate() {
        let mut row = Vec::with_capacity(mat.ncols() + 1);
        row.push(feature.clone());
        row.extend((0..mat.ncols()).map(|k| fmt(mat[(i, k)])));
        writer.write_row(&row)?;
    }
    writer.finish()?;
    Ok(())
}

////////////////////
// Binary objects //
////////////////////

/// Serialise a value with bincode to `path`
///
/// ### Params
///
/// * `path` - Output path.
/// * `value` - The value to store.
pub fn save_bincode<P, T>(path: P, value: &T) -> LdaResult<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let path = path.as_ref();
    let partial = partial_path(path);
    let bytes = bincode::serde::encode_to_vec(value, config::standard())?;
    fs::write(&partial, bytes)?;
    fs::rename(&partial, path)?;
    info!("Wrote {}", path.display());
    Ok(())
}

/// Read a bincode serialised value from `path`
pub fn load_bincode<P, T>(path: P) -> LdaResult<T>
where
    P: AsRef<Path>,
    T: DeserializeOwned,
{
    let bytes = fs::read(path)?;
    let (value, _) = bincode::serde::decode_from_slice(&bytes, config::standard())?;
    Ok(value)
}

/// Read back a model written by the refit
///
/// ### Params
///
/// * `path` - Path to the `.model.p` file.
///
/// ### Returns
///
/// The `FittedModel` with its feature order and normalisation
pub fn load_fitted_model<P: AsRef<Path>>(path: P) -> LdaResult<FittedModel> {
    load_bincode(path)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::dge_io::open_maybe_gz;
    use faer::mat;
    use std::io::BufRead;

    #[test]
    fn test_table_writer_gz_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.tsv.gz");
        let mut w = TableWriter::create(&path, &["a".to_string(), "b".to_string()]).unwrap();
        w.write_row(&["1".to_string(), "x".to_string()]).unwrap();
        assert!(dir.path().join("t.tsv.gz.partial").exists());
        assert!(!path.exists());
        w.finish().unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("t.tsv.gz.partial").exists());
        let lines: Vec<String> =
            open_maybe_gz(&path).unwrap().lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["a\tb", "1\tx"]);
    }

    #[test]
    fn test_coherence_table_keeps_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.tsv");
        let rows = vec![
            CoherenceRow { r: 0, k: 0, score0: 1.5, score: 0.5 },
            CoherenceRow { r: 0, k: 1, score0: 0.0, score: f64::NAN },
        ];
        write_coherence_table(&path, &rows).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "R\tK\tScore0\tScore\n0\t0\t1.5\t0.5\n0\t1\t0\tNaN\n");
    }

    #[test]
    fn test_feature_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.tsv");
        let m = mat![[1.0, 2.0], [3.25, 4.0]];
        write_feature_matrix(
            &path,
            "gene",
            &["g1".to_string(), "g2".to_string()],
            m.as_ref(),
            |v| format!("{:.2}", v),
        )
        .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "gene\t0\t1\ng1\t1.00\t2.00\ng2\t3.25\t4.00\n");
    }

    #[test]
    fn test_bincode_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.p");
        let v: Vec<(String, f64)> = vec![("a".to_string(), 1.0), ("b".to_string(), 2.5)];
        save_bincode(&path, &v).unwrap();
        let back: Vec<(String, f64)> = load_bincode(&path).unwrap();
        assert_eq!(v, back);
    }
}
