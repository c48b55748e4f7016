//! Serde bridge for dense faer matrices
//!
//! Use via `#[serde(with = "crate::utils::mat_serde")]`. The matrix is stored
//! as its shape plus the values in column-major order.

use faer::Mat;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize)]
struct MatData {
    nrows: usize,
    ncols: usize,
    data: Vec<f64>,
}

pub fn serialize<S>(mat: &Mat<f64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let (nrows, ncols) = (mat.nrows(), mat.ncols());
    let mut data = Vec::with_capacity(nrows * ncols);
    for j in 0..ncols {
        for i in 0..nrows {
            data.push(mat[(i, j)]);
        }
    }
    MatData { nrows, ncols, data }.serialize(serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Mat<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let m = MatData::deserialize(deserializer)?;
    if m.data.len() != m.nrows * m.ncols {
        return Err(D::Error::custom(format!(
            "matrix of shape {}x{} cannot hold {} values",
            m.nrows,
            m.ncols,
            m.data.len()
        )));
    }
    Ok(Mat::from_fn(m.nrows, m.ncols, |i, j| m.data[i + j * m.nrows]))
}
