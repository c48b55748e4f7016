use faer::{Mat, MatRef};

//////////////////////////////
// Sparse format conversion //
//////////////////////////////

/// Type to describe the CompressedSparseFormat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedSparseFormat {
    /// CSC-formatted data
    Csc,
    /// CSR-formatted data
    Csr,
}

/// Compressed sparse matrix in either row or column major layout
///
/// Rows are units, columns are features throughout the crate. Within each
/// outer slice (row for CSR, column for CSC) the inner indices are sorted
/// ascending.
///
/// ### Fields
///
/// * `data` - The non-zero values.
/// * `indices` - Inner indices (column indices for CSR, row indices for CSC).
/// * `indptr` - Outer pointers (row pointers for CSR, column pointers for CSC).
/// * `cs_type` - The layout.
/// * `shape` - `(nrow, ncol)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedSparseData<T>
where
    T: Clone + Default,
{
    pub data: Vec<T>,
    pub indices: Vec<usize>,
    pub indptr: Vec<usize>,
    pub cs_type: CompressedSparseFormat,
    pub shape: (usize, usize),
}

impl<T> CompressedSparseData<T>
where
    T: Clone + Default,
{
    /// Generate a new CSR version of the matrix
    ///
    /// ### Params
    ///
    /// * `data` - The underlying data
    /// * `indices` - The index positions (in this case column indices)
    /// * `indptr` - The index pointer (in this case the row index pointers)
    /// * `shape` - `(nrow, ncol)`
    pub fn new_csr(data: &[T], indices: &[usize], indptr: &[usize], shape: (usize, usize)) -> Self {
        Self {
            data: data.to_vec(),
            indices: indices.to_vec(),
            indptr: indptr.to_vec(),
            cs_type: CompressedSparseFormat::Csr,
            shape,
        }
    }

    /// Returns the shape of the matrix
    ///
    /// ### Returns
    ///
    /// A tuple of `(nrow, ncol)`
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.shape.0
    }

    /// Number of columns
    pub fn ncols(&self) -> usize {
        self.shape.1
    }

    /// Returns the NNZ
    pub fn get_nnz(&self) -> usize {
        self.data.len()
    }

    /// Inner indices and values of one outer slice
    ///
    /// For CSR this is a row, for CSC a column.
    ///
    /// ### Params
    ///
    /// * `i` - Outer index
    ///
    /// ### Returns
    ///
    /// Tuple of `(indices, values)`
    pub fn outer_slice(&self, i: usize) -> (&[usize], &[T]) {
        let start = self.indptr[i];
        let end = self.indptr[i + 1];
        (&self.indices[start..end], &self.data[start..end])
    }

    /// Apply a function to every stored value, keeping the sparsity pattern
    ///
    /// ### Params
    ///
    /// * `f` - Function mapping the value.
    ///
    /// ### Returns
    ///
    /// The new matrix with the same layout
    pub fn map_values<U, F>(&self, f: F) -> CompressedSparseData<U>
    where
        U: Clone + Default,
        F: Fn(&T) -> U,
    {
        CompressedSparseData {
            data: self.data.iter().map(f).collect(),
            indices: self.indices.clone(),
            indptr: self.indptr.clone(),
            cs_type: self.cs_type,
            shape: self.shape,
        }
    }

    /// Select a subset of rows of a CSR matrix, in the given order
    ///
    /// Panics if the matrix is not CSR.
    ///
    /// ### Params
    ///
    /// * `rows` - The row indices to keep.
    ///
    /// ### Returns
    ///
    /// The CSR matrix with `rows.len()` rows
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        assert_eq!(
            self.cs_type,
            CompressedSparseFormat::Csr,
            "Row selection requires CSR layout"
        );
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        indptr.push(0_usize);

        for &r in rows {
            let (idx, vals) = self.outer_slice(r);
            indices.extend_from_slice(idx);
            data.extend_from_slice(vals);
            indptr.push(data.len());
        }

        Self {
            data,
            indices,
            indptr,
            cs_type: CompressedSparseFormat::Csr,
            shape: (rows.len(), self.shape.1),
        }
    }
}

impl<T> CompressedSparseData<T>
where
    T: Clone + Default + Copy + Into<f64>,
{
    /// Sums over each outer slice
    ///
    /// Row sums for CSR, column sums for CSC.
    pub fn outer_sums(&self) -> Vec<f64> {
        self.indptr
            .windows(2)
            .map(|w| self.data[w[0]..w[1]].iter().map(|&v| v.into()).sum())
            .collect()
    }

    /// Dense representation
    ///
    /// ### Returns
    ///
    /// Returns a dense faer matrix.
    pub fn to_dense_matrix(&self) -> Mat<f64> {
        let mut dense = Mat::<f64>::zeros(self.shape.0, self.shape.1);
        for outer in 0..(self.indptr.len() - 1) {
            let (idx, vals) = self.outer_slice(outer);
            for (&inner, &v) in idx.iter().zip(vals) {
                let (row, col) = match self.cs_type {
                    CompressedSparseFormat::Csr => (outer, inner),
                    CompressedSparseFormat::Csc => (inner, outer),
                };
                dense[(row, col)] = v.into();
            }
        }
        dense
    }
}

/// Transform CSR stored data into CSC stored data
///
/// This version does a full memory copy of the data.
///
/// ### Params
///
/// * `sparse_data` - The data stored in CSR format.
///
/// ### Returns
///
/// The data in CSC format
pub fn csr_to_csc<T>(sparse_data: CompressedSparseData<T>) -> CompressedSparseData<T>
where
    T: Clone + Default,
{
    let nnz = sparse_data.get_nnz();
    let (_, ncol) = sparse_data.shape();
    let mut col_ptr = vec![0; ncol + 1];

    // Count occurrences per column
    for &c in &sparse_data.indices {
        col_ptr[c + 1] += 1;
    }

    for i in 0..ncol {
        col_ptr[i + 1] += col_ptr[i];
    }

    let mut csc_data = vec![T::default(); nnz];
    let mut csc_row_ind = vec![0; nnz];
    let mut next = col_ptr[..ncol].to_vec();

    for row in 0..(sparse_data.indptr.len() - 1) {
        for idx in sparse_data.indptr[row]..sparse_data.indptr[row + 1] {
            let col = sparse_data.indices[idx];
            let pos = next[col];

            csc_data[pos] = sparse_data.data[idx].clone();
            csc_row_ind[pos] = row;

            next[col] += 1;
        }
    }

    CompressedSparseData {
        data: csc_data,
        indices: csc_row_ind,
        indptr: col_ptr,
        cs_type: CompressedSparseFormat::Csc,
        shape: sparse_data.shape(),
    }
}

////////////////////
// Sparse algebra //
////////////////////

/// Compute `X^T * D` for a CSR matrix `X` and a dense matrix `D`
///
/// ### Params
///
/// * `x` - CSR matrix of shape `(n, m)`.
/// * `d` - Dense matrix of shape `(n, k)`.
///
/// ### Returns
///
/// Dense matrix of shape `(m, k)`
pub fn csr_transpose_dense_mul(x: &CompressedSparseData<f64>, d: MatRef<f64>) -> Mat<f64> {
    assert_eq!(x.cs_type, CompressedSparseFormat::Csr);
    crate::assert_nrows!(x, d);

    let k = d.ncols();
    let mut res = Mat::<f64>::zeros(x.ncols(), k);
    for row in 0..x.nrows() {
        let (idx, vals) = x.outer_slice(row);
        for (&col, &v) in idx.iter().zip(vals) {
            for j in 0..k {
                res[(col, j)] += v * d[(row, j)];
            }
        }
    }
    res
}

///////////
// Tests //
///////////
