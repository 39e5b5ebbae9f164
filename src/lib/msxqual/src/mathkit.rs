//! Dense linear algebra: LU factorization with partial pivoting,
//! back-substitution, and numerical Jacobians.
//!
//! All arrays here are 1-indexed — index 0 is unused — by contract, not as
//! a storage optimization (design note 4): every solver above this one
//! (`NewtonSolver`) threads the same convention through so index arithmetic
//! never has to be translated at the boundary.

use crate::error::MsxError;

const TINY: f64 = 1e-20;

/// A square matrix sized `(n+1) x (n+1)`; row/column 0 is unused.
#[derive(Clone, Debug)]
pub struct Matrix1 {
    n: usize,
    data: Vec<f64>,
}

impl Matrix1 {
    pub fn zeros(n: usize) -> Self {
        Matrix1 {
            n,
            data: vec![0.0; (n + 1) * (n + 1)],
        }
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * (self.n + 1) + j]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        self.data[i * (self.n + 1) + j] = v;
    }

    pub fn n(&self) -> usize {
        self.n
    }
}

/// 1-indexed vector of length `n+1`; index 0 unused.
pub fn vec1(n: usize) -> Vec<f64> {
    vec![0.0; n + 1]
}

/// Crout-style LU decomposition with implicit row scaling and partial
/// pivoting, in place. `indx[1..=n]` receives the row permutation.
/// Returns the parity of the number of row swaps (+1.0 / -1.0), used by
/// callers that need the determinant sign.
pub fn lu_decompose(a: &mut Matrix1, n: usize, indx: &mut [usize]) -> Result<f64, MsxError> {
    let mut vv = vec1(n);
    let mut d = 1.0;

    for i in 1..=n {
        let mut big = 0.0;
        for j in 1..=n {
            let v = a.get(i, j).abs();
            if v > big {
                big = v;
            }
        }
        if big == 0.0 {
            return Err(MsxError::numeric(
                "mathkit",
                "jacobian",
                "singular matrix: a zero row in LU decomposition",
            ));
        }
        vv[i] = 1.0 / big;
    }

    for j in 1..=n {
        for i in 1..j {
            let mut sum = a.get(i, j);
            for k in 1..i {
                sum -= a.get(i, k) * a.get(k, j);
            }
            a.set(i, j, sum);
        }

        let mut big = 0.0;
        let mut imax = j;
        for i in j..=n {
            let mut sum = a.get(i, j);
            for k in 1..j {
                sum -= a.get(i, k) * a.get(k, j);
            }
            a.set(i, j, sum);
            let dum = vv[i] * sum.abs();
            if dum >= big {
                big = dum;
                imax = i;
            }
        }

        if j != imax {
            for k in 1..=n {
                let tmp = a.get(imax, k);
                a.set(imax, k, a.get(j, k));
                a.set(j, k, tmp);
            }
            d = -d;
            vv[imax] = vv[j];
        }
        indx[j] = imax;

        let mut pivot = a.get(j, j);
        if pivot.abs() < TINY {
            // Callers must treat this as a near-singular matrix, not a
            // hard failure: replace with the tiny value to avoid division
            // by zero and keep going.
            pivot = if pivot < 0.0 { -TINY } else { TINY };
            a.set(j, j, pivot);
        }

        if j != n {
            let dum = 1.0 / pivot;
            for i in (j + 1)..=n {
                let v = a.get(i, j) * dum;
                a.set(i, j, v);
            }
        }
    }

    Ok(d)
}

/// Forward then backward substitution sweep using the permutation produced
/// by `lu_decompose`. `b` is solved in place.
pub fn lu_back_substitute(a: &Matrix1, n: usize, indx: &[usize], b: &mut [f64]) {
    let mut ii = 0usize;
    for i in 1..=n {
        let ip = indx[i];
        let mut sum = b[ip];
        b[ip] = b[i];
        if ii != 0 {
            for j in ii..i {
                sum -= a.get(i, j) * b[j];
            }
        } else if sum != 0.0 {
            ii = i;
        }
        b[i] = sum;
    }
    for i in (1..=n).rev() {
        let mut sum = b[i];
        for j in (i + 1)..=n {
            sum -= a.get(i, j) * b[j];
        }
        b[i] = sum / a.get(i, i);
    }
}

/// Numerical Jacobian of `f(x) -> fx` over `n` variables (1-indexed),
/// using a centered difference when `x[j] != 0` and a forward difference
/// at `x[j] == 0`, with perturbation `eps = 1e-7`.
///
/// `fx` must already hold `f(x)` on entry (reused as the base function
/// value for forward differences and to avoid a redundant evaluation).
pub fn numerical_jacobian(
    mut f: impl FnMut(&[f64], &mut [f64]),
    x: &mut [f64],
    fx: &[f64],
    n: usize,
    jac: &mut Matrix1,
) {
    const EPS: f64 = 1e-7;
    let mut f_plus = vec1(n);
    let mut f_minus = vec1(n);

    for j in 1..=n {
        let xj = x[j];
        if xj != 0.0 {
            let h = EPS * xj.abs();
            x[j] = xj + h;
            f(x, &mut f_plus);
            x[j] = xj - h;
            f(x, &mut f_minus);
            x[j] = xj;
            let denom = 2.0 * h;
            for i in 1..=n {
                jac.set(i, j, (f_plus[i] - f_minus[i]) / denom);
            }
        } else {
            let h = EPS;
            x[j] = xj + h;
            f(x, &mut f_plus);
            x[j] = xj;
            for i in 1..=n {
                jac.set(i, j, (f_plus[i] - fx[i]) / h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngExt;

    #[test]
    fn lu_solves_small_system() {
        // [2 1; 1 3] x = [3; 5] -> x = [4/5, 7/5]
        let n = 2;
        let mut a = Matrix1::zeros(n);
        a.set(1, 1, 2.0);
        a.set(1, 2, 1.0);
        a.set(2, 1, 1.0);
        a.set(2, 2, 3.0);
        let mut indx = vec![0usize; n + 1];
        lu_decompose(&mut a, n, &mut indx).unwrap();
        let mut b = vec1(n);
        b[1] = 3.0;
        b[2] = 5.0;
        lu_back_substitute(&a, n, &indx, &mut b);
        assert!((b[1] - 0.8).abs() < 1e-9);
        assert!((b[2] - 1.4).abs() < 1e-9);
    }

    #[test]
    fn lu_solves_random_spd_systems_within_tolerance() {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let n = 6;
            let mut raw: Vec<Vec<f64>> = vec![vec![0.0; n + 1]; n + 1];
            for i in 1..=n {
                for j in 1..=n {
                    raw[i][j] = rng.random_range(-1.0..1.0);
                }
            }
            // Make it diagonally dominant so it's well-conditioned.
            let mut a = Matrix1::zeros(n);
            for i in 1..=n {
                let mut rowsum = 0.0;
                for j in 1..=n {
                    if i != j {
                        rowsum += raw[i][j].abs();
                    }
                }
                for j in 1..=n {
                    a.set(i, j, raw[i][j]);
                }
                a.set(i, i, rowsum + 1.0);
            }
            let a_copy = a.clone();
            let mut indx = vec![0usize; n + 1];
            lu_decompose(&mut a, n, &mut indx).unwrap();
            let mut b = vec1(n);
            for v in b.iter_mut().skip(1) {
                *v = rng.random_range(-5.0..5.0);
            }
            let rhs = b.clone();
            lu_back_substitute(&a, n, &indx, &mut b);
            // residual r = A x - b
            let mut resid = 0.0;
            let mut rhs_norm = 0.0;
            for i in 1..=n {
                let mut axi = 0.0;
                for j in 1..=n {
                    axi += a_copy.get(i, j) * b[j];
                }
                resid += (axi - rhs[i]).powi(2);
                rhs_norm += rhs[i].powi(2);
            }
            let rel = resid.sqrt() / rhs_norm.sqrt().max(1e-12);
            assert!(rel < 1e-8, "relative residual too large: {rel}");
        }
    }

    #[test]
    fn jacobian_of_linear_system_is_the_matrix_itself() {
        let n = 2;
        let f = |x: &[f64], fx: &mut [f64]| {
            fx[1] = 2.0 * x[1] + 3.0 * x[2];
            fx[2] = x[1] - x[2];
        };
        let mut x = vec1(n);
        x[1] = 1.0;
        x[2] = -2.0;
        let mut fx = vec1(n);
        f(&x, &mut fx);
        let mut jac = Matrix1::zeros(n);
        numerical_jacobian(f, &mut x, &fx, n, &mut jac);
        assert!((jac.get(1, 1) - 2.0).abs() < 1e-5);
        assert!((jac.get(1, 2) - 3.0).abs() < 1e-5);
        assert!((jac.get(2, 1) - 1.0).abs() < 1e-5);
        assert!((jac.get(2, 2) - (-1.0)).abs() < 1e-5);
    }
}
