//! Damped Newton–Raphson solver for nonlinear algebraic systems,
//! built on `mathkit`.

use crate::mathkit::{lu_back_substitute, lu_decompose, numerical_jacobian, vec1, Matrix1};

pub const NEWTON_SINGULAR: i32 = -1;
pub const NEWTON_NO_CONVERGE: i32 = -2;
pub const NEWTON_TOO_LARGE: i32 = -3;

pub struct NewtonSolver {
    capacity: usize,
    jac: Matrix1,
    indx: Vec<usize>,
    f: Vec<f64>,
    dx: Vec<f64>,
}

impl NewtonSolver {
    pub fn open(capacity: usize) -> Self {
        NewtonSolver {
            capacity,
            jac: Matrix1::zeros(capacity),
            indx: vec![0usize; capacity + 1],
            f: vec1(capacity),
            dx: vec1(capacity),
        }
    }

    /// Solve `f(x) = 0` for `x` (1-indexed, length `n+1`), iterating at
    /// most `maxit` times. Convergence: `max_i |dx_i| / max(|x_i|, 10^-numsig)
    /// < 10^-numsig`. Returns the iteration count on success, or one of the
    /// negative error codes above.
    pub fn solve(
        &mut self,
        n: usize,
        x: &mut [f64],
        maxit: usize,
        numsig: i32,
        mut f: impl FnMut(&[f64], &mut [f64]),
    ) -> i32 {
        if n > self.capacity {
            return NEWTON_TOO_LARGE;
        }
        let tol = 10f64.powi(-numsig);

        for iter in 1..=maxit {
            f(x, &mut self.f);
            numerical_jacobian(&mut f, x, &self.f, n, &mut self.jac);

            let mut neg_f = vec1(n);
            for i in 1..=n {
                neg_f[i] = -self.f[i];
            }

            let mut jac_copy = self.jac.clone();
            if lu_decompose(&mut jac_copy, n, &mut self.indx).is_err() {
                tracing::warn!(n, iter, "Newton solver's Jacobian was singular");
                return NEWTON_SINGULAR;
            }
            lu_back_substitute(&jac_copy, n, &self.indx, &mut neg_f);
            for i in 1..=n {
                self.dx[i] = neg_f[i];
                x[i] += self.dx[i];
            }

            let mut max_rel = 0.0f64;
            for i in 1..=n {
                let denom = x[i].abs().max(tol);
                let rel = self.dx[i].abs() / denom;
                if rel > max_rel {
                    max_rel = rel;
                }
            }
            if max_rel < tol {
                return iter as i32;
            }
        }
        tracing::warn!(n, maxit, "Newton solver failed to converge within maxit iterations");
        NEWTON_NO_CONVERGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_simple_quadratic_system() {
        // x^2 - 4 = 0, y - 2x = 0 -> x=2, y=4
        let mut solver = NewtonSolver::open(2);
        let mut x = vec1(2);
        x[1] = 1.5;
        x[2] = 1.0;
        let code = solver.solve(2, &mut x, 30, 6, |x, f| {
            f[1] = x[1] * x[1] - 4.0;
            f[2] = x[2] - 2.0 * x[1];
        });
        assert!(code > 0);
        assert!((x[1] - 2.0).abs() < 1e-6);
        assert!((x[2] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn reports_too_large_problem() {
        let mut solver = NewtonSolver::open(1);
        let mut x = vec1(2);
        let code = solver.solve(2, &mut x, 10, 6, |_, f| {
            f[1] = 0.0;
            f[2] = 0.0;
        });
        assert_eq!(code, NEWTON_TOO_LARGE);
    }
}
