//! Bridge between the `ndarray` matrices used throughout the smoother and the
//! `faer` factorizations backing them. One dense `f64` matrix type is used for
//! the whole core; every SVD, symmetric eigendecomposition and factor solve is
//! routed through here.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::solvers::{self, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatRef, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

/// Runs `f` against a faer view of `array`. The matrices passed around this
/// module are owned row-major arrays or their transposes, so those two
/// layouts are borrowed in place; anything with exotic strides (sliced or
/// reversed views) is copied once at this single entry point.
fn with_faer<S, T>(array: &ArrayBase<S, Ix2>, f: impl FnOnce(MatRef<'_, f64>) -> T) -> T
where
    S: Data<Elem = f64>,
{
    let (rows, cols) = array.dim();
    if let Some(slice) = array.as_slice() {
        return f(MatRef::from_row_major_slice(slice, rows, cols));
    }
    let transposed = array.t();
    if let Some(slice) = transposed.to_slice() {
        return f(MatRef::from_column_major_slice(slice, rows, cols));
    }
    let copied = Mat::from_fn(rows, cols, |i, j| array[(i, j)]);
    f(copied.as_ref())
}

fn to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let (rows, cols) = mat.shape();
    let mut out = Array2::zeros((rows, cols));
    for ((i, j), value) in out.indexed_iter_mut() {
        *value = mat[(i, j)];
    }
    out
}

fn diag_values(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_iter((0..mat.nrows()).map(|i| mat[(i, 0)]))
}

/// Thin singular value decomposition, `A = U diag(s) Vt`.
pub trait ThinSvd {
    /// Returns `(u, s, vt)` with `u: m x k`, `s: k`, `vt: k x n` and
    /// `k = min(m, n)`; singular values are ordered non-increasing.
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> ThinSvd for ArrayBase<S, Ix2> {
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), LinalgError> {
        let (rows, cols) = self.dim();
        let rank = rows.min(cols);

        let mut singular = Diag::<f64>::zeros(rank);
        let mut u_storage = Mat::<f64>::zeros(rows, rank);
        let mut v_storage = Mat::<f64>::zeros(cols, rank);

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::Thin,
            ComputeSvdVectors::Thin,
            par,
            Default::default(),
        ));
        let mut stack = MemStack::new(&mut mem);

        with_faer(self, |mat| {
            svd::svd(
                mat,
                singular.as_mut(),
                Some(u_storage.as_mut()),
                Some(v_storage.as_mut()),
                par,
                &mut stack,
                Default::default(),
            )
        })
        .map_err(|_| LinalgError::SvdNoConvergence)?;

        let s = diag_values(singular.as_ref());
        let u = to_array(u_storage.as_ref());
        let v_ref = v_storage.as_ref();
        let vt = Array2::from_shape_fn((rank, cols), |(i, j)| v_ref[(j, i)]);
        Ok((u, s, vt))
    }
}

/// Symmetric (self-adjoint) eigendecomposition reading the lower triangle.
pub trait SymEig {
    fn sym_eig(&self) -> Result<(Array1<f64>, Array2<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> SymEig for ArrayBase<S, Ix2> {
    fn sym_eig(&self) -> Result<(Array1<f64>, Array2<f64>), LinalgError> {
        with_faer(self, |mat| {
            let eigen = mat
                .self_adjoint_eigen(Side::Lower)
                .map_err(LinalgError::SelfAdjointEigen)?;
            Ok((diag_values(eigen.S()), to_array(eigen.U())))
        })
    }
}

/// Solve `self * X = rhs` for symmetric positive definite `self` via Cholesky.
pub trait CholeskySolve {
    fn cholesky_solve<S: Data<Elem = f64>>(
        &self,
        rhs: &ArrayBase<S, Ix2>,
    ) -> Result<Array2<f64>, LinalgError>;
}

impl<S0: Data<Elem = f64>> CholeskySolve for ArrayBase<S0, Ix2> {
    fn cholesky_solve<S: Data<Elem = f64>>(
        &self,
        rhs: &ArrayBase<S, Ix2>,
    ) -> Result<Array2<f64>, LinalgError> {
        with_faer(self, |mat| {
            let factor = mat.llt(Side::Lower).map_err(LinalgError::Cholesky)?;
            with_faer(rhs, |rhs_mat| {
                let solution = factor.solve(rhs_mat);
                Ok(to_array(solution.as_ref()))
            })
        })
    }
}

/// Solve `self * X = rhs` for general square `self` with full-pivot LU.
pub trait LuSolve {
    fn lu_solve<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix2>) -> Array2<f64>;
}

impl<S0: Data<Elem = f64>> LuSolve for ArrayBase<S0, Ix2> {
    fn lu_solve<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix2>) -> Array2<f64> {
        with_faer(self, |mat| {
            let lu = mat.full_piv_lu();
            with_faer(rhs, |rhs_mat| {
                let solution = lu.solve(rhs_mat);
                to_array(solution.as_ref())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn thin_svd_reconstructs() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = random_matrix(6, 4, &mut rng);
        let (u, s, vt) = a.thin_svd().unwrap();
        assert_eq!(u.dim(), (6, 4));
        assert_eq!(s.len(), 4);
        assert_eq!(vt.dim(), (4, 4));

        let mut us = u.clone();
        for (j, &sv) in s.iter().enumerate() {
            us.column_mut(j).mapv_inplace(|x| x * sv);
        }
        let back = us.dot(&vt);
        for (x, y) in back.iter().zip(a.iter()) {
            assert!((x - y).abs() < 1e-10, "{x} vs {y}");
        }
        for w in s.windows(2) {
            assert!(w[0] >= w[1]);
        }
    }

    #[test]
    fn strided_views_take_the_copy_path() {
        let mut rng = StdRng::seed_from_u64(19);
        let a = random_matrix(6, 8, &mut rng);
        // Every second column: contiguous in neither orientation, so the
        // bridge must fall back to copying.
        let strided = a.slice(ndarray::s![.., ..;2]);
        let (u, s, vt) = strided.thin_svd().unwrap();
        let (_, s_owned, _) = strided.to_owned().thin_svd().unwrap();

        for (x, y) in s.iter().zip(s_owned.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
        let mut us = u.clone();
        for (j, &sv) in s.iter().enumerate() {
            us.column_mut(j).mapv_inplace(|x| x * sv);
        }
        let back = us.dot(&vt);
        for (x, y) in back.iter().zip(strided.iter()) {
            assert!((x - y).abs() < 1e-10);
        }
    }

    #[test]
    fn cholesky_solve_matches_direct() {
        let mut rng = StdRng::seed_from_u64(11);
        let g = random_matrix(5, 5, &mut rng);
        let spd = g.t().dot(&g) + Array2::<f64>::eye(5) * 5.0;
        let rhs = random_matrix(5, 2, &mut rng);
        let x = spd.cholesky_solve(&rhs).unwrap();
        let back = spd.dot(&x);
        for (a, b) in back.iter().zip(rhs.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn lu_solve_handles_nonsymmetric() {
        let a = array![[2.0, 1.0], [-1.0, 3.0]];
        let rhs = array![[1.0], [0.0]];
        let x = a.lu_solve(&rhs);
        let back = a.dot(&x);
        assert!((back[(0, 0)] - 1.0).abs() < 1e-12);
        assert!(back[(1, 0)].abs() < 1e-12);
    }

    #[test]
    fn sym_eig_recovers_spectrum() {
        let a = array![[4.0, 0.0], [0.0, 1.0]];
        let (vals, vecs) = a.sym_eig().unwrap();
        let mut sorted: Vec<f64> = vals.to_vec();
        sorted.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert!((sorted[0] - 1.0).abs() < 1e-12);
        assert!((sorted[1] - 4.0).abs() < 1e-12);
        assert_eq!(vecs.dim(), (2, 2));
    }
}
