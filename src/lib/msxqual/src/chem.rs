//! Per-segment chemistry: species classification, and the rate/equilibrium/
//! formula evaluation pipeline.

use crate::error::MathWarning;
use crate::eval_context::VarContext;
use crate::mathkit::vec1;
use crate::model::{ExprKind, Species, SpeciesType, Term};
use crate::newton::NewtonSolver;
use crate::ode::{euler_step, rk45_integrate, Rosenbrock2};
use crate::options::{Coupling, QualityOptions, SolverKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Pipe,
    Tank,
}

/// Per-domain classification: disjoint rate/equilibrium/formula species
/// sets, each carrying the 0-based species index alongside its IR.
#[derive(Default)]
struct Classification {
    rate: Vec<usize>,
    equil: Vec<usize>,
    formula: Vec<usize>,
}

pub struct ChemEngine {
    n_species: usize,
    pipe: Classification,
    tank: Classification,
    solver: SolverKind,
    coupling: Coupling,
    maxit: usize,
    numsig: i32,
    rk_h: f64,
}

fn classify(species: &[Species], pick: impl Fn(&Species) -> (ExprKind, Option<&crate::expr::Expr>)) -> Classification {
    let mut c = Classification::default();
    for (i, sp) in species.iter().enumerate() {
        let (kind, _ir) = pick(sp);
        match kind {
            ExprKind::Rate => c.rate.push(i),
            ExprKind::Equilibrium => c.equil.push(i),
            ExprKind::Formula => c.formula.push(i),
            ExprKind::None => {}
        }
    }
    c
}

impl ChemEngine {
    pub fn open(species: &[Species], options: &QualityOptions) -> Self {
        let n_species = species.len();
        let pipe = classify(species, |sp| (sp.pipe_expr.kind, sp.pipe_expr.ir.as_ref()));
        let tank = classify(species, |sp| {
            if sp.tank_expr.kind == ExprKind::None {
                (sp.pipe_expr.kind, sp.pipe_expr.ir.as_ref())
            } else {
                (sp.tank_expr.kind, sp.tank_expr.ir.as_ref())
            }
        });

        ChemEngine {
            n_species,
            pipe,
            tank,
            solver: options.solver,
            coupling: options.coupling,
            maxit: options.maxit,
            numsig: options.numsig,
            rk_h: 0.0,
        }
    }

    fn classification(&self, domain: Domain) -> &Classification {
        match domain {
            Domain::Pipe => &self.pipe,
            Domain::Tank => &self.tank,
        }
    }

    /// Runs the full per-segment chemistry pipeline (rate species advanced
    /// by the configured integrator, equilibrium species resolved by
    /// Newton iteration, then formula species evaluated directly)
    /// on `c` (length `n_species`, mutated in place). `dt` is already
    /// converted to reaction-rate units. Returns the first math warning
    /// encountered, if any (subsequent ones in the same call are
    /// suppressed).
    #[allow(clippy::too_many_arguments)]
    pub fn react_segment(
        &mut self,
        domain: Domain,
        c: &mut [f64],
        dt: f64,
        species: &[Species],
        terms: &[Term],
        parameters: &[f64],
        constants: &[f64],
        hydraulic: &[f64; 9],
    ) -> Option<MathWarning> {
        if dt <= 0.0 {
            return None;
        }
        let cls = self.classification(domain);
        let (rate, equil, formula) = (cls.rate.clone(), cls.equil.clone(), cls.formula.clone());
        let mut warning = None;

        if !rate.is_empty() {
            let n = rate.len();
            let mut y = vec1(n);
            for (k, &idx) in rate.iter().enumerate() {
                y[k + 1] = c[idx];
            }

            let atol: Vec<f64> = std::iter::once(0.0)
                .chain(rate.iter().map(|&idx| species[idx].atol))
                .collect();
            let rtol: Vec<f64> = std::iter::once(0.0)
                .chain(rate.iter().map(|&idx| species[idx].rtol))
                .collect();

            let coupling = self.coupling;
            let maxit = self.maxit;
            let numsig = self.numsig;
            let n_species = self.n_species;
            let mut scratch = c.to_vec();
            let mut local_warning: Option<MathWarning> = None;

            let code = {
                let mut deriv = |_t: f64, y: &[f64], nn: usize, dy: &mut [f64]| {
                    for (k, &idx) in rate.iter().enumerate() {
                        scratch[idx] = y[k + 1];
                    }
                    if coupling == Coupling::Full && !equil.is_empty() {
                        let ok = solve_equilibrium_static(
                            &equil, &mut scratch, species, terms, parameters, constants,
                            hydraulic, domain, maxit, numsig,
                        );
                        if ok.is_none() {
                            for i in 1..=nn {
                                dy[i] = 0.0;
                            }
                            return;
                        }
                    }
                    let ctx = VarContext::new(n_species, terms, parameters, constants, hydraulic);
                    ctx.rebind(&scratch);
                    for (k, &idx) in rate.iter().enumerate() {
                        if let Some(expr) = expr_for(domain, species, idx) {
                            dy[k + 1] = ctx.eval(expr);
                        } else {
                            dy[k + 1] = 0.0;
                        }
                    }
                    if ctx.took_math_error() && local_warning.is_none() {
                        local_warning = Some(MathWarning {
                            object: format!("species[{}]", rate[0]),
                            expression_kind: "rate",
                            message: "NaN produced during rate evaluation".to_string(),
                        });
                    }
                };

                match self.solver {
                    SolverKind::Euler => euler_step(&mut deriv, &mut y, n, dt),
                    SolverKind::Rk45 => {
                        let mut h = if self.rk_h > 0.0 { self.rk_h } else { dt.abs() * 0.1 };
                        let code = rk45_integrate(
                            &mut deriv, &mut y, n, 0.0, dt, &atol, &rtol, &mut h, 1000,
                        );
                        self.rk_h = h;
                        code
                    }
                    SolverKind::Rosenbrock2 => {
                        // A fresh solver per segment-step: the Jacobian reuse
                        // the design aims for happens across this call's own
                        // accepted steps, not across unrelated segments.
                        let mut rosen = Rosenbrock2::new(n, 0.0);
                        rosen.integrate(&mut deriv, &mut y, 0.0, dt, &atol, &rtol, 1000)
                    }
                }
            };

            if code < 0 {
                warning = Some(MathWarning {
                    object: "rate-integration".to_string(),
                    expression_kind: "rate",
                    message: format!("integrator failed with code {code}"),
                });
            }
            if warning.is_none() {
                warning = local_warning;
            }

            for (k, &idx) in rate.iter().enumerate() {
                c[idx] = y[k + 1].max(0.0);
            }
        }

        if !equil.is_empty() {
            let ok = solve_equilibrium_static(
                &equil, c, species, terms, parameters, constants, hydraulic, domain,
                self.maxit, self.numsig,
            );
            if ok.is_none() && warning.is_none() {
                warning = Some(MathWarning {
                    object: "equilibrium".to_string(),
                    expression_kind: "equilibrium",
                    message: "Newton solver failed to converge".to_string(),
                });
            }
        }

        if !formula.is_empty() {
            let ctx = VarContext::new(self.n_species, terms, parameters, constants, hydraulic);
            ctx.rebind(c);
            for &idx in &formula {
                if let Some(expr) = expr_for(domain, species, idx) {
                    c[idx] = ctx.eval(expr).max(0.0);
                }
            }
            if ctx.took_math_error() && warning.is_none() {
                warning = Some(MathWarning {
                    object: "formula".to_string(),
                    expression_kind: "formula",
                    message: "NaN produced during formula evaluation".to_string(),
                });
            }
        }

        warning
    }

    /// Reacted-mass accumulation. `delta_c[i] = c_after
    /// - c_before` for species `i`; `v` is the segment volume.
    pub fn accumulate_reacted_mass(
        &self,
        reacted: &mut [f64],
        species: &[Species],
        delta_c: &[f64],
        v: f64,
        diam: f64,
        l_per_ft3: f64,
        area_ucf: f64,
    ) {
        for (i, sp) in species.iter().enumerate() {
            match sp.kind {
                SpeciesType::Bulk => {
                    reacted[i] += v * delta_c[i] * l_per_ft3;
                }
                SpeciesType::Wall => {
                    if diam > 0.0 {
                        reacted[i] += v * (4.0 / diam) * area_ucf * delta_c[i];
                    }
                }
            }
        }
    }
}

fn expr_for<'a>(domain: Domain, species: &'a [Species], idx: usize) -> Option<&'a crate::expr::Expr> {
    match domain {
        Domain::Pipe => species[idx].pipe_expr.ir.as_ref(),
        Domain::Tank => {
            if species[idx].tank_expr.kind == ExprKind::None {
                species[idx].pipe_expr.ir.as_ref()
            } else {
                species[idx].tank_expr.ir.as_ref()
            }
        }
    }
}

/// Standalone equilibrium solve usable both from inside the rate-ODE
/// callback (FULL_COUPLING) and as the top-level equilibrium step.
/// Returns `None` on Newton failure (singular or non-convergent).
#[allow(clippy::too_many_arguments)]
fn solve_equilibrium_static(
    equil: &[usize],
    c: &mut [f64],
    species: &[Species],
    terms: &[Term],
    parameters: &[f64],
    constants: &[f64],
    hydraulic: &[f64; 9],
    domain: Domain,
    maxit: usize,
    numsig: i32,
) -> Option<i32> {
    let n = equil.len();
    if n == 0 {
        return Some(0);
    }
    let mut solver = NewtonSolver::open(n);
    let mut x = vec1(n);
    for (k, &idx) in equil.iter().enumerate() {
        x[k + 1] = c[idx];
    }
    let n_species = species.len();
    let mut scratch = c.to_vec();
    let code = solver.solve(n, &mut x, maxit, numsig, |x, f| {
        for (k, &idx) in equil.iter().enumerate() {
            scratch[idx] = x[k + 1];
        }
        let ctx = VarContext::new(n_species, terms, parameters, constants, hydraulic);
        ctx.rebind(&scratch);
        for (k, &idx) in equil.iter().enumerate() {
            f[k + 1] = expr_for(domain, species, idx).map(|e| ctx.eval(e)).unwrap_or(0.0);
        }
    });
    if code < 0 {
        return None;
    }
    for (k, &idx) in equil.iter().enumerate() {
        c[idx] = x[k + 1].max(0.0);
    }
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Parser;
    use crate::model::{ExprKind, SpeciesExpr, SpeciesType};

    fn species_a_decay_b_equil() -> Vec<Species> {
        // A: dA/dt = -k*A, k as a constant (index resolved below)
        let resolve = |name: &str| -> Option<usize> {
            match name {
                "A" => Some(1),
                "B" => Some(2),
                "k" => Some(3), // constant
                _ => None,
            }
        };
        let a_rate = Parser::parse("-k*A", &resolve).unwrap();
        let b_equil = Parser::parse("A - B - 0.5", &resolve).unwrap();
        vec![
            Species {
                name: "A".into(),
                kind: SpeciesType::Bulk,
                units: "MG".into(),
                atol: 1e-6,
                rtol: 1e-6,
                report_precision: 2,
                pipe_expr: SpeciesExpr {
                    kind: ExprKind::Rate,
                    ir: Some(a_rate),
                },
                tank_expr: SpeciesExpr::none(),
            },
            Species {
                name: "B".into(),
                kind: SpeciesType::Bulk,
                units: "MG".into(),
                atol: 1e-6,
                rtol: 1e-6,
                report_precision: 2,
                pipe_expr: SpeciesExpr {
                    kind: ExprKind::Equilibrium,
                    ir: Some(b_equil),
                },
                tank_expr: SpeciesExpr::none(),
            },
        ]
    }

    #[test]
    fn decay_plus_equilibrium_matches_analytic_solution() {
        let species = species_a_decay_b_equil();
        let mut options = QualityOptions::default();
        options.solver = SolverKind::Rk45;
        let mut engine = ChemEngine::open(&species, &options);
        let terms: Vec<Term> = vec![];
        let parameters: Vec<f64> = vec![];
        let constants = [0.01f64]; // k = 0.01/day
        let hydraulic = [0.0; 9];

        let mut c = vec![1.0, 0.5];
        // 100 days, single big step (RK45 subdivides internally).
        engine.react_segment(
            Domain::Pipe,
            &mut c,
            100.0,
            &species,
            &terms,
            &parameters,
            &constants,
            &hydraulic,
        );
        let expected_a = (-1.0f64).exp();
        assert!((c[0] - expected_a).abs() < 1e-3, "A={} expected={}", c[0], expected_a);
        assert!((c[1] - (c[0] - 0.5)).abs() < 1e-3, "B={}", c[1]);
    }
}
