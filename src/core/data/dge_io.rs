use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::utils::config::ColumnBindings;
use crate::utils::errors::{LdaError, LdaResult};

/////////////////////
// Data structures //
/////////////////////

/// One line of the long-format input
///
/// ### Fields
///
/// * `unit` - Unit identifier.
/// * `feature` - Feature identifier.
/// * `count` - The count of the feature in the unit.
/// * `attrs` - Passthrough attributes, in the order of
///   `ColumnBindings::unit_attr`. Empty if attributes were not requested.
#[derive(Debug, Clone, PartialEq)]
pub struct DgeRecord {
    pub unit: String,
    pub feature: String,
    pub count: u32,
    pub attrs: Vec<String>,
}

impl DgeRecord {
    /// Convenience constructor without attributes
    pub fn new(unit: &str, feature: &str, count: u32) -> Self {
        Self {
            unit: unit.to_string(),
            feature: feature.to_string(),
            count,
            attrs: Vec::new(),
        }
    }
}

/// Column positions resolved from the header
#[derive(Debug, Clone)]
struct ColumnIndices {
    unit: usize,
    feature: usize,
    count: usize,
    attrs: Vec<usize>,
}

/////////////
// Helpers //
/////////////

/// Open a file for buffered reading, decompressing `.gz` transparently
///
/// ### Params
///
/// * `path` - Path to the file.
///
/// ### Returns
///
/// A boxed buffered reader
pub fn open_maybe_gz<P: AsRef<Path>>(path: P) -> std::io::Result<Box<dyn BufRead>> {
    let file = File::open(path.as_ref())?;
    let is_gz = path
        .as_ref()
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    let inner: Box<dyn Read> = if is_gz {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::with_capacity(1 << 20, inner)))
}

fn parse_header_line(line: &str) -> Vec<String> {
    line.trim_end_matches(['\n', '\r'])
        .split('\t')
        .map(|x| x.trim().to_lowercase())
        .collect()
}

fn resolve_column(header: &[String], name: &str, path: &Path) -> LdaResult<usize> {
    header
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| LdaError::Schema {
            column: name.to_string(),
            path: path.display().to_string(),
        })
}

////////////
// Reader //
////////////

/// Streaming reader over the long-format (unit, feature, count) table
///
/// Yields one `DgeRecord` per data line, in file order. Nothing is buffered
/// beyond the current line, so the reader can be re-opened for every pass
/// over a corpus that does not fit into memory.
pub struct DgeReader {
    reader: Box<dyn BufRead>,
    columns: ColumnIndices,
    path: PathBuf,
    line_no: usize,
    buffer: String,
}

impl DgeReader {
    /// Open the input and resolve the requested columns
    ///
    /// ### Params
    ///
    /// * `path` - Path to the input (`.gz` is decompressed).
    /// * `bindings` - Column names; matched case-insensitively.
    /// * `with_attrs` - Shall the passthrough attribute columns be read.
    ///
    /// ### Returns
    ///
    /// The reader positioned after the header, or `LdaError::Schema` if a
    /// column is missing.
    pub fn open<P: AsRef<Path>>(
        path: P,
        bindings: &ColumnBindings,
        with_attrs: bool,
    ) -> LdaResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = open_maybe_gz(&path)?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let header = parse_header_line(&line);

        let attrs = if with_attrs {
            bindings
                .unit_attr
                .iter()
                .map(|a| resolve_column(&header, &a.to_lowercase(), &path))
                .collect::<LdaResult<Vec<usize>>>()?
        } else {
            Vec::new()
        };

        let columns = ColumnIndices {
            unit: resolve_column(&header, &bindings.unit.to_lowercase(), &path)?,
            feature: resolve_column(&header, &bindings.feature.to_lowercase(), &path)?,
            count: resolve_column(&header, &bindings.count.to_lowercase(), &path)?,
            attrs,
        };

        Ok(Self {
            reader,
            columns,
            path,
            line_no: 1,
            buffer: String::with_capacity(256),
        })
    }

    fn parse_line(&self, line: &str) -> LdaResult<DgeRecord> {
        let fields: Vec<&str> = line.split('\t').collect();
        let get = |idx: usize| -> LdaResult<&str> {
            fields.get(idx).copied().ok_or_else(|| LdaError::Parse {
                line: self.line_no,
                msg: format!(
                    "{}: expected at least {} fields, found {}",
                    self.path.display(),
                    idx + 1,
                    fields.len()
                ),
            })
        };

        let count_str = get(self.columns.count)?;
        let count = count_str.trim().parse::<u32>().map_err(|_| LdaError::Parse {
            line: self.line_no,
            msg: format!(
                "{}: count '{}' is not a non-negative integer",
                self.path.display(),
                count_str
            ),
        })?;

        let attrs = self
            .columns
            .attrs
            .iter()
            .map(|&i| get(i).map(|s| s.to_string()))
            .collect::<LdaResult<Vec<String>>>()?;

        Ok(DgeRecord {
            unit: get(self.columns.unit)?.to_string(),
            feature: get(self.columns.feature)?.to_string(),
            count,
            attrs,
        })
    }
}

impl Iterator for DgeReader {
    type Item = LdaResult<DgeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buffer.clear();
            match self.reader.read_line(&mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line_no += 1;
                    let line = self.buffer.trim_end_matches(['\n', '\r']);
                    if line.is_empty() {
                        continue;
                    }
                    return Some(self.parse_line(line));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_gz(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("input.tsv.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(content.as_bytes()).unwrap();
        enc.finish().unwrap();
        path
    }

    #[test]
    fn test_reads_gz_with_case_insensitive_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gz(
            dir.path(),
            "Random_Index\tX\tGene\tgn\nAA1\t1.5\tg1\t3\nAA1\t1.5\tg2\t1\n\nAB2\t2.0\tg1\t7\n",
        );
        let mut bindings = ColumnBindings::default();
        bindings.unit_attr = vec!["x".to_string()];

        let records: Vec<DgeRecord> = DgeReader::open(&path, &bindings, true)
            .unwrap()
            .collect::<LdaResult<_>>()
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].unit, "AA1");
        assert_eq!(records[0].feature, "g1");
        assert_eq!(records[0].count, 3);
        assert_eq!(records[2].attrs, vec!["2.0".to_string()]);
    }

    #[test]
    fn test_missing_column_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gz(dir.path(), "random_index\tgene\nAA1\tg1\n");

        let res = DgeReader::open(&path, &ColumnBindings::default(), false);

        match res {
            Err(LdaError::Schema { column, .. }) => assert_eq!(column, "gn"),
            _ => panic!("expected a schema error"),
        }
    }

    #[test]
    fn test_bad_count_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gz(dir.path(), "random_index\tgene\tgn\nAA1\tg1\t2\nAA1\tg2\tx\n");

        let mut reader = DgeReader::open(&path, &ColumnBindings::default(), false).unwrap();
        assert!(reader.next().unwrap().is_ok());
        match reader.next().unwrap() {
            Err(LdaError::Parse { line, .. }) => assert_eq!(line, 3),
            _ => panic!("expected a parse error"),
        }
    }

    #[test]
    fn test_header_is_lowercased() {
        let header = parse_header_line("Random_Index\tGENE\t gn\r\n");
        assert_eq!(header, vec!["random_index", "gene", "gn"]);
    }
}
