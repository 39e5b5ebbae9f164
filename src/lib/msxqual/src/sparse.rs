//! Sparse symmetric positive-definite factorization for the dispersion
//! nodal system: a minimum-degree reordering that bounds
//! fill-in, a symbolic factorization that fixes each column's nonzero
//! pattern once, and a numeric Cholesky (George-Liu's GSFCT) reused across
//! every quality step that keeps the same network topology, plus
//! column-oriented forward/backward substitution.

use crate::error::MsxError;
use std::collections::{BTreeSet, HashMap};

pub struct SparseCholesky {
    n: usize,
    /// `perm[k]` is the original (0-based) node id eliminated k-th.
    perm: Vec<usize>,
    /// `invp[node]` is that node's elimination position.
    invp: Vec<usize>,
    /// `pattern[k]`: elimination positions `i > k` with a nonzero `L[i][k]`.
    pattern: Vec<Vec<usize>>,
    /// `l[k]`: sub-diagonal entries of column `k`, keyed by row position.
    l: Vec<HashMap<usize, f64>>,
    diag: Vec<f64>,
}

impl SparseCholesky {
    /// Builds the minimum-degree ordering and symbolic factorization from
    /// the sparsity graph alone (`edges` need only list each off-diagonal
    /// nonzero once; self-loops are ignored). Numeric values are supplied
    /// later, once per quality step, via [`SparseCholesky::factorize`].
    pub fn open(n: usize, edges: &[(usize, usize)]) -> Self {
        let mut adj: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for &(a, b) in edges {
            if a != b {
                adj[a].insert(b);
                adj[b].insert(a);
            }
        }

        let mut remaining: BTreeSet<usize> = (0..n).collect();
        let mut perm = vec![0usize; n];
        let mut invp = vec![0usize; n];
        let mut pattern_orig: Vec<Vec<usize>> = Vec::with_capacity(n);
        let mut work = adj;

        for k in 0..n {
            let node = *remaining
                .iter()
                .min_by_key(|&&v| (work[v].len(), v))
                .expect("remaining is non-empty for k < n");
            remaining.remove(&node);
            perm[k] = node;
            invp[node] = k;

            let neighbors: Vec<usize> = work[node]
                .iter()
                .copied()
                .filter(|v| remaining.contains(v))
                .collect();
            for &a in &neighbors {
                for &b in &neighbors {
                    if a != b {
                        work[a].insert(b);
                    }
                }
                work[a].remove(&node);
            }
            pattern_orig.push(neighbors);
        }

        let pattern: Vec<Vec<usize>> = pattern_orig
            .into_iter()
            .map(|neighbors| {
                let mut v: Vec<usize> = neighbors.into_iter().map(|orig| invp[orig]).collect();
                v.sort_unstable();
                v
            })
            .collect();

        SparseCholesky {
            n,
            perm,
            invp,
            l: vec![HashMap::new(); n],
            diag: vec![0.0; n],
            pattern,
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Numeric factorization (right-looking, column by column in
    /// elimination order). `get(i, j)` must return `A[i][j]` for original
    /// (unpermuted) node ids; only entries within the symbolic pattern (or
    /// the diagonal) are ever queried.
    pub fn factorize(&mut self, get: impl Fn(usize, usize) -> f64) -> Result<(), MsxError> {
        let n = self.n;
        for k in 0..n {
            let node_k = self.perm[k];
            self.diag[k] = get(node_k, node_k);
            self.l[k].clear();
            for &i in &self.pattern[k] {
                let node_i = self.perm[i];
                self.l[k].insert(i, get(node_i, node_k));
            }
        }

        for k in 0..n {
            if self.diag[k] <= 0.0 {
                let err = MsxError::numeric(
                    "sparse-cholesky",
                    "factorization",
                    format!("non-positive pivot at column {k}"),
                );
                tracing::warn!(column = k, "sparse Cholesky factorization hit a non-positive pivot");
                return Err(err);
            }
            let lkk = self.diag[k].sqrt();
            self.diag[k] = lkk;

            let col_k: Vec<(usize, f64)> = self.pattern[k]
                .iter()
                .map(|&i| {
                    let v = self.l[k].get(&i).copied().unwrap_or(0.0) / lkk;
                    (i, v)
                })
                .collect();
            for &(i, v) in &col_k {
                self.l[k].insert(i, v);
            }

            for &(i, lik) in &col_k {
                self.diag[i] -= lik * lik;
                for &(j, ljk) in &col_k {
                    if j > i {
                        if let Some(entry) = self.l[i].get_mut(&j) {
                            *entry -= ljk * lik;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Solves `A x = b` (original node ordering in, original node ordering
    /// out) using the factorization from the most recent `factorize` call.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut y: Vec<f64> = (0..n).map(|k| b[self.perm[k]]).collect();

        for k in 0..n {
            y[k] /= self.diag[k];
            if let Some(lk) = self.l.get(k) {
                for (&i, &lik) in lk {
                    y[i] -= lik * y[k];
                }
            }
        }

        let mut x = y;
        for k in (0..n).rev() {
            let mut s = x[k];
            if let Some(lk) = self.l.get(k) {
                for (&i, &lik) in lk {
                    s -= lik * x[i];
                }
            }
            x[k] = s / self.diag[k];
        }

        let mut out = vec![0.0; n];
        for k in 0..n {
            out[self.perm[k]] = x[k];
        }
        out
    }

    pub fn invp(&self) -> &[usize] {
        &self.invp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factorizes_and_solves_small_spd_system() {
        // A = [[4,1,0],[1,3,1],[0,1,2]], b = [1,2,3]
        let a = [[4.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 2.0]];
        let edges = [(0, 1), (1, 2)];
        let mut chol = SparseCholesky::open(3, &edges);
        chol.factorize(|i, j| a[i][j]).unwrap();
        let b = [1.0, 2.0, 3.0];
        let x = chol.solve(&b);

        for i in 0..3 {
            let axi: f64 = (0..3).map(|j| a[i][j] * x[j]).sum();
            assert!((axi - b[i]).abs() < 1e-9, "row {i}: {axi} vs {}", b[i]);
        }
    }

    #[test]
    fn diagonal_system_solves_trivially() {
        let a = [[2.0, 0.0], [0.0, 5.0]];
        let chol = SparseCholesky::open(2, &[]);
        let mut chol = chol;
        chol.factorize(|i, j| a[i][j]).unwrap();
        let x = chol.solve(&[4.0, 10.0]);
        assert!((x[0] - 2.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_non_positive_definite_matrix() {
        let a = [[1.0, 2.0], [2.0, 1.0]];
        let mut chol = SparseCholesky::open(2, &[(0, 1)]);
        let err = chol.factorize(|i, j| a[i][j]).unwrap_err();
        assert_eq!(err.error_code(), 3);
    }
}
