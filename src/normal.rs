//! Normal equations: assemble N = AᵀPA and b = AᵀPℓ, factorise, solve.
//!
//! Constrained networks go through a plain sparse Cholesky (LDLᵀ with every
//! pivot checked positive).  Free networks factor N + s·CCᵀ, where the
//! columns of G span the datum null space and C = S·G carries the datum
//! weights, normalised to CᵀG = I.  The solution then satisfies Cᵀx = 0 and
//! the cofactor matrix is (N + s·CCᵀ)⁻¹ − GGᵀ/s, the pseudo-inverse when
//! S = I.
//!
//! When the factorisation fails, a dense diagonally pivoted elimination
//! estimates how many directions are missing so the error can say so.

use crate::datum::DatumConstraints;
use crate::equations::LinearSystem;
use crate::types::*;
use ndarray::Array2;
use sprs::{CsMat, FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::{Ldl, LdlNumeric};

/// Pivots below this fraction of the largest diagonal count as zero.
const PIVOT_TOLERANCE: f64 = 1e-12;

// ─────────────────────────────────────────────────────────────
//  Assembly
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NormalEquations {
    /// N = AᵀPA, CSC, n × n.
    pub matrix: CsMat<f64>,
    /// b = AᵀPℓ.
    pub rhs: Vec<f64>,
}

impl NormalEquations {
    pub fn assemble(system: &LinearSystem) -> Self {
        let m = system.num_observations();
        let n = system.num_unknowns();

        // Ã = diag(√p)·A, so N = ÃᵀÃ
        let mut tri = TriMat::new((m, n));
        let mut rhs = vec![0.0; n];
        for (i, row) in system.design.outer_iterator().enumerate() {
            let p = system.weights[i];
            let sp = p.sqrt();
            let pl = p * system.misclosure[i];
            for (col, &a) in row.iter() {
                tri.add_triplet(i, col, a * sp);
                rhs[col] += a * pl;
            }
        }
        let weighted: CsMat<f64> = tri.to_csr();
        let weighted_t: CsMat<f64> = weighted.transpose_view().to_csr();
        let product: CsMat<f64> = &weighted_t * &weighted;

        Self { matrix: product.to_csc(), rhs }
    }

    pub fn size(&self) -> usize {
        self.rhs.len()
    }

    /// Largest diagonal entry, the reference scale for pivot checks.
    pub fn diagonal_scale(&self) -> f64 {
        (0..self.size())
            .filter_map(|i| self.matrix.get(i, i).copied())
            .fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}

// ─────────────────────────────────────────────────────────────
//  Factorisation
// ─────────────────────────────────────────────────────────────

/// Factorisation of the normal matrix, with the datum handling baked in.
pub enum Factorization {
    /// N itself is positive definite.
    Cholesky(LdlNumeric<f64, usize>),
    /// N + s·CCᵀ for datum constraints C.
    MinimumNorm {
        ldl: LdlNumeric<f64, usize>,
        datum: DatumConstraints,
        shift: f64,
    },
}

impl std::fmt::Debug for Factorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cholesky(_) => write!(f, "Factorization::Cholesky(...)"),
            Self::MinimumNorm { datum, .. } => {
                write!(f, "Factorization::MinimumNorm(defect = {})", datum.rank())
            }
        }
    }
}

impl Factorization {
    /// Factor N (constrained) or N + s·CCᵀ (free, `datum` given).
    pub fn new(normal: &NormalEquations, datum: Option<DatumConstraints>) -> Result<Self, AdjustmentError> {
        let scale = normal.diagonal_scale();
        match datum {
            None => {
                let ldl = checked_cholesky(&normal.matrix, scale).map_err(|_| {
                    singular(&normal.matrix, "insufficient fixed or controlled stations, or a station not determined by its observations")
                })?;
                Ok(Self::Cholesky(ldl))
            }
            Some(datum) => {
                let shift = if scale > 0.0 { scale } else { 1.0 };
                let regularized = add_low_rank(&normal.matrix, &datum.constraints, shift);
                let ldl = checked_cholesky(&regularized, scale.max(shift)).map_err(|_| {
                    singular(&regularized, "datum defect larger than the translations, rotation and scale removed, or too few datum stations")
                })?;
                Ok(Self::MinimumNorm { ldl, datum, shift })
            }
        }
    }

    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        match self {
            Self::Cholesky(ldl) | Self::MinimumNorm { ldl, .. } => ldl.solve(rhs),
        }
    }

    /// Q_xx = N⁻¹, or for a free network the cofactor matrix in its datum.
    pub fn cofactor_matrix(&self, n: usize) -> Array2<f64> {
        let mut q = Array2::<f64>::zeros((n, n));
        let mut e = vec![0.0; n];
        for j in 0..n {
            e[j] = 1.0;
            let col = self.solve(&e);
            for (i, v) in col.into_iter().enumerate() {
                q[[i, j]] = v;
            }
            e[j] = 0.0;
        }

        if let Self::MinimumNorm { datum, shift, .. } = self {
            let ggt = datum.basis.dot(&datum.basis.t());
            q.scaled_add(-1.0 / shift, &ggt);
        }

        // symmetrise away round-off
        let qt = q.t().to_owned();
        (q + qt) * 0.5
    }
}

fn checked_cholesky(matrix: &CsMat<f64>, scale: f64) -> Result<LdlNumeric<f64, usize>, sprs::errors::LinalgError> {
    let ldl = Ldl::new()
        .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
        .check_symmetry(SymmetryCheck::DontCheckSymmetry)
        .numeric(matrix.view())?;
    // Validate positive-definiteness: every D entry clearly above zero
    let tol = PIVOT_TOLERANCE * scale;
    for (i, &di) in ldl.d().iter().enumerate() {
        if !(di > tol) {
            return Err(sprs::errors::LinalgError::SingularMatrix(
                sprs::errors::SingularMatrixInfo {
                    index: i,
                    reason: "D <= 0 in Cholesky factorization (not SPD)",
                },
            ));
        }
    }
    Ok(ldl)
}

/// N + s·CCᵀ as a new CSC matrix.
fn add_low_rank(matrix: &CsMat<f64>, constraints: &Array2<f64>, shift: f64) -> CsMat<f64> {
    let n = matrix.rows();
    let mut tri = TriMat::new((n, n));
    for (&v, (i, j)) in matrix.iter() {
        tri.add_triplet(i, j, v);
    }
    let cct = constraints.dot(&constraints.t());
    for i in 0..n {
        for j in 0..n {
            let v = shift * cct[[i, j]];
            if v != 0.0 {
                tri.add_triplet(i, j, v);
            }
        }
    }
    tri.to_csc()
}

fn singular(matrix: &CsMat<f64>, hint: &'static str) -> AdjustmentError {
    let size = matrix.rows();
    let deficiency = rank_deficiency(&to_dense(matrix)).max(1);
    AdjustmentError::SingularNormalEquations { size, rank_deficiency: deficiency, hint }
}

// ─────────────────────────────────────────────────────────────
//  Dense helpers
// ─────────────────────────────────────────────────────────────

pub fn to_dense(matrix: &CsMat<f64>) -> Array2<f64> {
    let mut dense = Array2::<f64>::zeros((matrix.rows(), matrix.cols()));
    for (&v, (i, j)) in matrix.iter() {
        dense[[i, j]] += v;
    }
    dense
}

/// Number of pivots that vanish in a symmetric elimination with diagonal
/// pivoting, i.e. n − rank for a positive semidefinite matrix.
pub fn rank_deficiency(a: &Array2<f64>) -> usize {
    let n = a.nrows();
    let mut m = a.clone();
    let scale = (0..n).map(|i| m[[i, i]].abs()).fold(0.0_f64, f64::max);
    if scale == 0.0 {
        return n;
    }
    let tol = 1e-10 * scale;

    let mut remaining: Vec<usize> = (0..n).collect();
    let mut rank = 0;
    loop {
        // Find pivot
        let Some((pos, &p)) = remaining
            .iter()
            .enumerate()
            .max_by(|(_, &i), (_, &j)| m[[i, i]].total_cmp(&m[[j, j]]))
        else {
            break;
        };
        let pivot = m[[p, p]];
        if pivot <= tol {
            break;
        }
        rank += 1;
        remaining.swap_remove(pos);

        // Eliminate the pivot row/column from the rest
        for &i in &remaining {
            let factor = m[[i, p]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for &j in &remaining {
                m[[i, j]] -= factor * m[[p, j]];
            }
        }
    }
    n - rank
}
