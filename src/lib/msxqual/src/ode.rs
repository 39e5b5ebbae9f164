//! Three ODE integrators sharing one `f(t, y, n, dy)` callback contract:
//! forward Euler, embedded Dormand–Prince RK4(5) with a PI
//! step controller, and a second-order Rosenbrock method reusing its
//! Jacobian across accepted steps.

use crate::mathkit::{lu_back_substitute, lu_decompose, vec1, Matrix1};

pub const ODE_MAX_STEPS_EXCEEDED: i32 = -1;
pub const ODE_STEP_TOO_SMALL: i32 = -2;

pub trait Derivative {
    /// `y`/`dy` are 1-indexed, length `n+1`; index 0 unused.
    fn eval(&mut self, t: f64, y: &[f64], n: usize, dy: &mut [f64]);
}

impl<F: FnMut(f64, &[f64], usize, &mut [f64])> Derivative for F {
    fn eval(&mut self, t: f64, y: &[f64], n: usize, dy: &mut [f64]) {
        self(t, y, n, dy)
    }
}

/// One evaluation, `y <- y + h * f(0, y)`. Used when accuracy is not
/// critical and reaction rates are mild.
pub fn euler_step(f: &mut impl Derivative, y: &mut [f64], n: usize, h: f64) -> i32 {
    let mut dy = vec1(n);
    f.eval(0.0, y, n, &mut dy);
    for i in 1..=n {
        y[i] += h * dy[i];
    }
    1
}

// --- Dormand-Prince RK4(5) -------------------------------------------

const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;
const A71: f64 = 35.0 / 384.0;
const A73: f64 = 500.0 / 1113.0;
const A74: f64 = 125.0 / 192.0;
const A75: f64 = -2187.0 / 6784.0;
const A76: f64 = 11.0 / 84.0;

// 5th-order solution uses the same coefficients as A7* (FSAL).
// 4th-order embedded coefficients (for the error estimate):
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const SAFE: f64 = 0.9;
const FAC1: f64 = 0.2;
const FAC2: f64 = 10.0;
const BETA: f64 = 0.04;

/// Integrates from `t0` to `t0 + dt`, returning the number of function
/// evaluations used, or a negative error code. `htry` is the initial step
/// guess and is updated in place so callers can reuse it as the next
/// segment's starting guess.
pub fn rk45_integrate(
    f: &mut impl Derivative,
    y: &mut [f64],
    n: usize,
    t0: f64,
    dt: f64,
    atol: &[f64],
    rtol: &[f64],
    htry: &mut f64,
    max_steps: usize,
) -> i32 {
    if dt == 0.0 {
        return 0;
    }
    let mut t = t0;
    let t_end = t0 + dt;
    let dir = if dt > 0.0 { 1.0 } else { -1.0 };
    let mut h = htry.abs().min(dt.abs()).max(1e-12) * dir;
    let mut nfev = 0usize;
    let mut steps = 0usize;
    let mut err_old = 1.0f64;
    let mut first_step = true;

    let mut k1 = vec1(n);
    let mut k2 = vec1(n);
    let mut k3 = vec1(n);
    let mut k4 = vec1(n);
    let mut k5 = vec1(n);
    let mut k6 = vec1(n);
    let mut k7 = vec1(n);
    let mut ytmp = vec1(n);
    let mut y5 = vec1(n);

    f.eval(t, y, n, &mut k1);
    nfev += 1;

    loop {
        if steps >= max_steps {
            tracing::warn!(max_steps, "RK45 integrator exceeded its step budget");
            return ODE_MAX_STEPS_EXCEEDED;
        }
        if (t - t_end) * dir >= 0.0 {
            break;
        }
        if h.abs() < 1e-8 {
            return ODE_STEP_TOO_SMALL;
        }
        // clamp to the interval remainder
        if (t + h - t_end) * dir > 0.0 {
            h = t_end - t;
        }
        steps += 1;

        for i in 1..=n {
            ytmp[i] = y[i] + h * A21 * k1[i];
        }
        f.eval(t + C2 * h, &ytmp, n, &mut k2);
        nfev += 1;

        for i in 1..=n {
            ytmp[i] = y[i] + h * (A31 * k1[i] + A32 * k2[i]);
        }
        f.eval(t + C3 * h, &ytmp, n, &mut k3);
        nfev += 1;

        for i in 1..=n {
            ytmp[i] = y[i] + h * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
        }
        f.eval(t + C4 * h, &ytmp, n, &mut k4);
        nfev += 1;

        for i in 1..=n {
            ytmp[i] = y[i] + h * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
        }
        f.eval(t + C5 * h, &ytmp, n, &mut k5);
        nfev += 1;

        for i in 1..=n {
            ytmp[i] =
                y[i] + h * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
        }
        f.eval(t + h, &ytmp, n, &mut k6);
        nfev += 1;

        for i in 1..=n {
            y5[i] = y[i]
                + h * (A71 * k1[i] + A73 * k3[i] + A74 * k4[i] + A75 * k5[i] + A76 * k6[i]);
        }
        f.eval(t + h, &y5, n, &mut k7);
        nfev += 1;

        let mut err_norm = 0.0f64;
        for i in 1..=n {
            let err_i = h
                * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i] + E7 * k7[i]);
            let sc = atol[i.min(atol.len() - 1)]
                + rtol[i.min(rtol.len() - 1)] * y[i].abs().max(y5[i].abs());
            let sc = if sc <= 0.0 { 1e-12 } else { sc };
            err_norm += (err_i / sc).powi(2);
        }
        err_norm = (err_norm / n as f64).sqrt().max(1e-300);

        if err_norm <= 1.0 {
            t += h;
            y[..=n].copy_from_slice(&y5[..=n]);
            k1[..=n].copy_from_slice(&k7[..=n]);
            let fac = if first_step {
                SAFE * err_norm.powf(-1.0 / 5.0)
            } else {
                SAFE * err_norm.powf(-(0.2 + BETA)) * err_old.powf(BETA)
            };
            let fac = fac.clamp(1.0 / FAC2, 1.0 / FAC1);
            h *= fac;
            err_old = err_norm.max(1e-4);
            first_step = false;
        } else {
            let fac = (SAFE * err_norm.powf(-1.0 / 5.0)).clamp(1.0 / FAC2, 1.0 / FAC1);
            h *= fac;
        }
    }

    *htry = h;
    nfev as i32
}

// --- Rosenbrock-2 ------------------------------------------------------

const ROS_GAMMA: f64 = 1.0 + std::f64::consts::FRAC_1_SQRT_2;

/// Per-worker Rosenbrock state: the reused Jacobian
/// and a flag for whether the previous step was accepted.
pub struct Rosenbrock2 {
    n: usize,
    jac: Matrix1,
    prev_accepted: bool,
    h: f64,
    err_old: f64,
}

impl Rosenbrock2 {
    pub fn new(n: usize, h0: f64) -> Self {
        Rosenbrock2 {
            n,
            jac: Matrix1::zeros(n),
            prev_accepted: false,
            h: h0,
            err_old: 1.0,
        }
    }

    pub fn integrate(
        &mut self,
        f: &mut impl Derivative,
        y: &mut [f64],
        t0: f64,
        dt: f64,
        atol: &[f64],
        rtol: &[f64],
        max_steps: usize,
    ) -> i32 {
        let n = self.n;
        if dt == 0.0 {
            return 0;
        }
        let dir = if dt > 0.0 { 1.0 } else { -1.0 };
        let mut t = t0;
        let t_end = t0 + dt;
        if self.h == 0.0 {
            self.h = dt.abs() * 0.1 * dir;
        }
        let mut h = self.h.abs().min(dt.abs()).max(1e-12) * dir;
        let mut nfev = 0usize;
        let mut steps = 0usize;

        let mut fy = vec1(n);
        let mut k1 = vec1(n);
        let mut k2 = vec1(n);
        let mut ytmp = vec1(n);
        let mut ynew = vec1(n);
        let mut indx = vec![0usize; n + 1];

        loop {
            if steps >= max_steps {
                self.h = h;
                tracing::warn!(max_steps, "Rosenbrock2 integrator exceeded its step budget");
                return ODE_MAX_STEPS_EXCEEDED;
            }
            if (t - t_end) * dir >= 0.0 {
                break;
            }
            if h.abs() < 1e-8 {
                self.h = h;
                return ODE_STEP_TOO_SMALL;
            }
            if (t + h - t_end) * dir > 0.0 {
                h = t_end - t;
            }
            steps += 1;

            f.eval(t, y, n, &mut fy);
            nfev += 1;

            if !self.prev_accepted {
                crate::mathkit::numerical_jacobian(
                    |x, fx| f.eval(t, x, n, fx),
                    &mut y.to_vec(),
                    &fy,
                    n,
                    &mut self.jac,
                );
                nfev += 2 * n;
            }

            // W = I/(gamma h) - J, solve W K1 = f(y)
            let mut w = Matrix1::zeros(n);
            for i in 1..=n {
                for j in 1..=n {
                    let jij = self.jac.get(i, j);
                    w.set(i, j, -jij);
                }
                w.set(i, i, w.get(i, i) + 1.0 / (ROS_GAMMA * h));
            }

            let lu_ok = lu_decompose(&mut w, n, &mut indx);
            if lu_ok.is_err() {
                h *= 0.5;
                continue;
            }

            for i in 1..=n {
                k1[i] = fy[i];
            }
            lu_back_substitute(&w, n, &indx, &mut k1);

            for i in 1..=n {
                ytmp[i] = y[i] + h * k1[i];
            }
            let mut f2 = vec1(n);
            f.eval(t + h, &ytmp, n, &mut f2);
            nfev += 1;
            for i in 1..=n {
                k2[i] = f2[i] - 2.0 * k1[i];
            }
            lu_back_substitute(&w, n, &indx, &mut k2);

            for i in 1..=n {
                ynew[i] = y[i] + 1.5 * h * k1[i] + 0.5 * h * k2[i];
            }

            let mut err_norm = 0.0f64;
            for i in 1..=n {
                let err_i = ynew[i] - (y[i] + h * k1[i]);
                let sc = atol[i.min(atol.len() - 1)]
                    + rtol[i.min(rtol.len() - 1)] * ynew[i].abs().max(y[i].abs());
                let sc = if sc <= 0.0 { 1e-12 } else { sc };
                err_norm += (err_i / sc).powi(2);
            }
            err_norm = (err_norm / n as f64).sqrt().max(1e-300);

            if err_norm <= 1.0 {
                t += h;
                y[..=n].copy_from_slice(&ynew[..=n]);
                self.prev_accepted = true;
                let fac = (SAFE * err_norm.powf(-0.5) * self.err_old.powf(BETA))
                    .clamp(1.0 / FAC2, 1.0 / FAC1);
                h *= fac;
                self.err_old = err_norm.max(1e-4);
            } else {
                self.prev_accepted = false;
                let fac = (SAFE * err_norm.powf(-0.5)).clamp(1.0 / FAC2, 1.0 / FAC1);
                h *= fac;
            }
        }

        self.h = h;
        nfev as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn euler_decays_exponential() {
        let k = 0.01;
        let mut y = vec1(1);
        y[1] = 1.0;
        let mut f = |_t: f64, y: &[f64], _n: usize, dy: &mut [f64]| {
            dy[1] = -k * y[1];
        };
        for _ in 0..1000 {
            euler_step(&mut f, &mut y, 1, 1.0);
        }
        let expected = (-k * 1000.0f64).exp();
        assert!((y[1] - expected).abs() / expected < 0.05);
    }

    #[test]
    fn rk45_matches_analytic_decay() {
        let k = 0.01;
        let mut y = vec1(1);
        y[1] = 1.0;
        let mut f = |_t: f64, y: &[f64], _n: usize, dy: &mut [f64]| {
            dy[1] = -k * y[1];
        };
        let mut h = 1.0;
        let atol = [0.0, 1e-10];
        let rtol = [0.0, 1e-8];
        let code = rk45_integrate(&mut f, &mut y, 1, 0.0, 100.0, &atol, &rtol, &mut h, 1000);
        assert!(code > 0);
        let expected = (-k * 100.0f64).exp();
        assert!((y[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn rosenbrock_matches_analytic_decay() {
        let k = 0.01;
        let mut y = vec1(1);
        y[1] = 1.0;
        let mut f = |_t: f64, y: &[f64], _n: usize, dy: &mut [f64]| {
            dy[1] = -k * y[1];
        };
        let mut solver = Rosenbrock2::new(1, 1.0);
        let atol = [0.0, 1e-10];
        let rtol = [0.0, 1e-8];
        let code = solver.integrate(&mut f, &mut y, 0.0, 100.0, &atol, &rtol, 1000);
        assert!(code > 0);
        let expected = (-k * 100.0f64).exp();
        assert!((y[1] - expected).abs() < 1e-4);
    }
}
