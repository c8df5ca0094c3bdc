//! Bridges between `ndarray` storage and `faer` factorisations, plus the small set of sparse
//! kernels (products, triangular solves, Gram assembly) needed by the Vecchia factors.

use crate::error::LinalgError;
use faer::linalg::solvers::Solve;
pub use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt};
use faer::sparse::linalg::solvers::Llt as SparseLlt;
use faer::sparse::{SparseColMat, SparseRowMat, Triplet};
use faer::{MatMut, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Row-major sparse matrix used for B, its gradients and the prediction blocks.
pub type SparseMatrix = SparseRowMat<usize, f64>;

/// Zero-copy `MatRef` over an ndarray matrix; layouts with non-positive strides are copied.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.as_standard_layout().into_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = match &self.owned {
            Some(owned) => {
                let strides = owned.strides();
                (owned.as_ptr(), owned.nrows(), owned.ncols(), strides[0], strides[1])
            }
            None => (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            ),
        };
        // SAFETY: pointer, shape and strides come from a live ndarray borrowed for 'a with
        // positive strides, or from the compact copy owned by this wrapper.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let (s0, s1) = (strides[0], strides[1]);
    // SAFETY: the view covers exactly the elements owned by `array` for its borrow.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

#[inline]
pub fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    // SAFETY: single column over the vector's own storage.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

pub fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

/// Dense Cholesky factor of a symmetric positive definite matrix.
pub struct FaerCholeskyFactor {
    factor: FaerLlt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array1_to_col_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let mut rhs = rhs.as_standard_layout().into_owned();
        let mut rhs_view = array2_to_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    pub fn lower_triangular(&self) -> Array2<f64> {
        mat_to_array(self.factor.L())
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, LinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, LinalgError> {
        let view = FaerArrayView::new(self);
        let factor = view.as_ref().llt(side).map_err(LinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

/// Factor of a small symmetric system: Cholesky, or LDLT when the caller accepts a matrix that
/// is not numerically positive definite.
pub enum SymmetricFactor {
    Llt(FaerLlt<f64>),
    Ldlt(FaerLdlt<f64>),
}

impl SymmetricFactor {
    pub fn llt(matrix: &Array2<f64>, side: Side) -> Result<Self, LinalgError> {
        let view = FaerArrayView::new(matrix);
        let factor = FaerLlt::new(view.as_ref(), side).map_err(LinalgError::Cholesky)?;
        Ok(SymmetricFactor::Llt(factor))
    }

    pub fn ldlt(matrix: &Array2<f64>, side: Side) -> Result<Self, LinalgError> {
        let view = FaerArrayView::new(matrix);
        let factor = FaerLdlt::new(view.as_ref(), side).map_err(LinalgError::Ldlt)?;
        Ok(SymmetricFactor::Ldlt(factor))
    }

    pub fn is_cholesky(&self) -> bool {
        matches!(self, SymmetricFactor::Llt(_))
    }

    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut view = array1_to_col_mat_mut(&mut rhs);
        match self {
            SymmetricFactor::Llt(f) => f.solve_in_place(view.as_mut()),
            SymmetricFactor::Ldlt(f) => f.solve_in_place(view.as_mut()),
        }
        rhs
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let mut rhs = rhs.as_standard_layout().into_owned();
        let mut view = array2_to_mat_mut(&mut rhs);
        match self {
            SymmetricFactor::Llt(f) => f.solve_in_place(view.as_mut()),
            SymmetricFactor::Ldlt(f) => f.solve_in_place(view.as_mut()),
        }
        rhs
    }
}

/// Solves `L X = rhs` for a dense lower-triangular `L`.
pub fn solve_lower_triangular(l: &Array2<f64>, rhs: &Array2<f64>) -> Array2<f64> {
    let n = l.nrows();
    let mut out = rhs.as_standard_layout().into_owned();
    for c in 0..out.ncols() {
        for i in 0..n {
            let mut acc = out[[i, c]];
            for j in 0..i {
                acc -= l[[i, j]] * out[[j, c]];
            }
            out[[i, c]] = acc / l[[i, i]];
        }
    }
    out
}

/// Assembles a row-major sparse matrix; entries must not repeat.
pub fn sparse_from_triplets(
    nrows: usize,
    ncols: usize,
    entries: &[(usize, usize, f64)],
) -> Result<SparseMatrix, LinalgError> {
    let triplets: Vec<Triplet<usize, usize, f64>> = entries
        .iter()
        .map(|&(r, c, v)| Triplet::new(r, c, v))
        .collect();
    let csc = SparseColMat::try_new_from_triplets(nrows, ncols, &triplets)
        .map_err(|e| LinalgError::SparseAssembly(format!("{e:?}")))?;
    csc.as_ref()
        .to_row_major()
        .map_err(|e| LinalgError::SparseAssembly(format!("{e:?}")))
}

/// Iterates the stored entries of row `i` as `(column, value)` pairs.
pub fn row_entries(m: &SparseMatrix, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
    let symbolic = m.symbolic();
    let row_ptr = symbolic.row_ptr();
    let col_idx = symbolic.col_idx();
    let values = m.val();
    (row_ptr[i]..row_ptr[i + 1]).map(move |a| (col_idx[a], values[a]))
}

/// Value stored at `(i, j)`, zero when the entry is not part of the pattern.
pub fn sparse_get(m: &SparseMatrix, i: usize, j: usize) -> f64 {
    row_entries(m, i)
        .filter(|&(c, _)| c == j)
        .map(|(_, v)| v)
        .sum()
}

pub fn sparse_to_dense(m: &SparseMatrix) -> Array2<f64> {
    let mut dense = Array2::<f64>::zeros((m.nrows(), m.ncols()));
    for i in 0..m.nrows() {
        for (j, v) in row_entries(m, i) {
            dense[[i, j]] += v;
        }
    }
    dense
}

pub fn sparse_matvec(m: &SparseMatrix, x: &Array1<f64>) -> Array1<f64> {
    Array1::from_shape_fn(m.nrows(), |i| row_entries(m, i).map(|(j, v)| v * x[j]).sum())
}

/// `mᵀ x`.
pub fn sparse_t_matvec(m: &SparseMatrix, x: &Array1<f64>) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(m.ncols());
    for i in 0..m.nrows() {
        let xi = x[i];
        if xi == 0.0 {
            continue;
        }
        for (j, v) in row_entries(m, i) {
            out[j] += v * xi;
        }
    }
    out
}

/// `m · dense`.
pub fn sparse_dense_product(m: &SparseMatrix, dense: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((m.nrows(), dense.ncols()));
    for i in 0..m.nrows() {
        for (j, v) in row_entries(m, i) {
            out.row_mut(i).scaled_add(v, &dense.row(j));
        }
    }
    out
}

/// In-place forward substitution `L x = b` for a square lower-triangular sparse matrix whose
/// diagonal is stored.
pub fn sparse_lower_solve(l: &SparseMatrix, b: &mut Array1<f64>) {
    for i in 0..l.nrows() {
        let mut acc = b[i];
        let mut diag = 1.0;
        for (j, v) in row_entries(l, i) {
            if j < i {
                acc -= v * b[j];
            } else if j == i {
                diag = v;
            }
        }
        b[i] = acc / diag;
    }
}

/// Forward substitution applied to every column of `b`.
pub fn sparse_lower_solve_mat(l: &SparseMatrix, b: &mut Array2<f64>) {
    for i in 0..l.nrows() {
        let mut diag = 1.0;
        for (j, v) in row_entries(l, i) {
            if j < i {
                let (head, mut tail) = b.view_mut().split_at(ndarray::Axis(0), i);
                tail.row_mut(0).scaled_add(-v, &head.row(j));
            } else if j == i {
                diag = v;
            }
        }
        if diag != 1.0 {
            b.row_mut(i).mapv_inplace(|x| x / diag);
        }
    }
}

/// In-place back substitution `Lᵀ x = b`.
pub fn sparse_lower_transpose_solve(l: &SparseMatrix, b: &mut Array1<f64>) {
    let n = l.nrows();
    for i in (0..n).rev() {
        let diag = sparse_get(l, i, i);
        let diag = if diag == 0.0 { 1.0 } else { diag };
        b[i] /= diag;
        let xi = b[i];
        for (j, v) in row_entries(l, i) {
            if j < i {
                b[j] -= v * xi;
            }
        }
    }
}

/// Dense inverse of a lower-triangular sparse matrix.
pub fn sparse_lower_inverse(l: &SparseMatrix) -> Array2<f64> {
    let mut inv = Array2::<f64>::eye(l.nrows());
    sparse_lower_solve_mat(l, &mut inv);
    inv
}

/// Upper triangle of `Σ_t X_tᵀ diag(w_t) X_t + diag(extra)` as a column-major sparse matrix,
/// ready for [`factorize_sparse_spd`].
pub fn weighted_gram_upper(
    dim: usize,
    terms: &[(&SparseMatrix, &Array1<f64>)],
    extra_diag: Option<&Array1<f64>>,
) -> Result<SparseColMat<usize, f64>, LinalgError> {
    let mut acc: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for &(x, w) in terms {
        for r in 0..x.nrows() {
            let entries: Vec<(usize, f64)> = row_entries(x, r).collect();
            for &(a, va) in &entries {
                for &(b, vb) in &entries {
                    if a <= b {
                        *acc.entry((a, b)).or_insert(0.0) += va * w[r] * vb;
                    }
                }
            }
        }
    }
    if let Some(extra) = extra_diag {
        for (i, &v) in extra.iter().enumerate() {
            if v != 0.0 {
                *acc.entry((i, i)).or_insert(0.0) += v;
            }
        }
    }
    let triplets: Vec<Triplet<usize, usize, f64>> = acc
        .into_iter()
        .map(|((r, c), v)| Triplet::new(r, c, v))
        .collect();
    SparseColMat::try_new_from_triplets(dim, dim, &triplets)
        .map_err(|e| LinalgError::SparseAssembly(format!("{e:?}")))
}

/// Sparse Cholesky factor of a symmetric positive definite matrix given by its upper triangle.
pub struct SparseSpdFactor {
    factor: SparseLlt<usize, f64>,
}

pub fn factorize_sparse_spd(upper: &SparseColMat<usize, f64>) -> Result<SparseSpdFactor, LinalgError> {
    let factor = upper
        .as_ref()
        .sp_cholesky(Side::Upper)
        .map_err(|_| LinalgError::SparseCholesky { dim: upper.ncols() })?;
    Ok(SparseSpdFactor { factor })
}

impl SparseSpdFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let rhs_arr = rhs.view().insert_axis(ndarray::Axis(1));
        let view = FaerArrayView::new(&rhs_arr);
        let out = self.factor.solve(view.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| out[(i, 0)])
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let view = FaerArrayView::new(rhs);
        let out = self.factor.solve(view.as_ref());
        mat_to_array(out.as_ref())
    }
}
