//! Adaptive Dormand-Prince 5(4) integrator
//!
//! Integrates `dy/dt = f(t, y)` over one interval with embedded error
//! control. The state is generic so that a tuple of tensors (the likelihood
//! flow) and plain vectors go through the same solver.
//!
//! - FSAL: the last stage of an accepted step is the first of the next one
//! - initial step chosen with the Hairer–Wanner heuristic
//! - mixed error norm: the largest RMS over the state's components
//! - a hard cap on function evaluations

use crate::error::{DiffusionError, IntegrationFailure, Result};

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

// 5th order weights
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// 5th minus 4th order weights
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const SAFETY: f64 = 0.9;
const IFACTOR: f64 = 10.0;
const DFACTOR: f64 = 0.2;
const ORDER: f64 = 5.0;

/// A state the solver can combine linearly and measure
pub trait OdeState: Sized {
    /// `scale·self + Σ cᵢ·termᵢ`
    fn lin_comb(&self, scale: f64, terms: &[(f64, &Self)]) -> Self;

    /// Mixed RMS norm of `self / (atol + rtol·max(|y0|, |y1|))`
    ///
    /// The RMS is taken per component and the largest one is returned. When
    /// `y1` is `None` only `|y0|` enters the tolerance.
    fn scaled_norm(&self, y0: &Self, y1: Option<&Self>, atol: f64, rtol: f64) -> Result<f64>;
}

impl OdeState for Vec<f64> {
    fn lin_comb(&self, scale: f64, terms: &[(f64, &Self)]) -> Self {
        let mut out: Vec<f64> = self.iter().map(|v| v * scale).collect();
        for (c, term) in terms {
            for (o, t) in out.iter_mut().zip(term.iter()) {
                *o += c * t;
            }
        }
        out
    }

    fn scaled_norm(&self, y0: &Self, y1: Option<&Self>, atol: f64, rtol: f64) -> Result<f64> {
        if self.is_empty() {
            return Ok(0.0);
        }
        let sum: f64 = self
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let reference = match y1 {
                    Some(y1) => y0[i].abs().max(y1[i].abs()),
                    None => y0[i].abs(),
                };
                (v / (atol + rtol * reference)).powi(2)
            })
            .sum();
        Ok((sum / self.len() as f64).sqrt())
    }
}

/// Tolerances and the evaluation budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OdeConfig {
    pub atol: f64,
    pub rtol: f64,
    pub max_fevals: usize,
}

impl Default for OdeConfig {
    fn default() -> Self {
        Self {
            atol: 1e-4,
            rtol: 1e-4,
            max_fevals: 10_000,
        }
    }
}

/// Final state of an integration and its cost
#[derive(Debug, Clone)]
pub struct OdeSolution<S> {
    pub state: S,
    pub fevals: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
}

/// Dormand-Prince 5(4) solver
#[derive(Debug, Clone, Copy, Default)]
pub struct Dopri5 {
    config: OdeConfig,
}

/// Counts evaluations and enforces the budget
struct Counted<F> {
    f: F,
    fevals: usize,
    limit: usize,
}

impl<F> Counted<F> {
    fn eval<S>(&mut self, t: f64, y: &S) -> Result<S>
    where
        F: FnMut(f64, &S) -> Result<S>,
    {
        if self.fevals >= self.limit {
            return Err(DiffusionError::EvaluationBudget {
                fevals: self.fevals,
                limit: self.limit,
            });
        }
        self.fevals += 1;
        (self.f)(t, y)
    }
}

impl Dopri5 {
    pub fn new(config: OdeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OdeConfig {
        &self.config
    }

    /// Integrates from `t0` to `t1` starting at `y0`
    ///
    /// Errors with [`DiffusionError::EvaluationBudget`] once `max_fevals`
    /// evaluations have been spent and with [`DiffusionError::Integration`]
    /// when the error estimate is not finite or the step size underflows.
    pub fn integrate<S, F>(&self, f: F, t0: f64, t1: f64, y0: S) -> Result<OdeSolution<S>>
    where
        S: OdeState,
        F: FnMut(f64, &S) -> Result<S>,
    {
        let OdeConfig {
            atol,
            rtol,
            max_fevals,
        } = self.config;
        let mut f = Counted {
            f,
            fevals: 0,
            limit: max_fevals,
        };

        if t0 == t1 {
            return Ok(OdeSolution {
                state: y0,
                fevals: 0,
                accepted_steps: 0,
                rejected_steps: 0,
            });
        }
        let direction = (t1 - t0).signum();

        let mut t = t0;
        let mut y = y0;
        let mut k1 = f.eval(t, &y)?;
        let mut h = self.initial_step(&mut f, t0, &y, &k1)?.min((t1 - t0).abs());

        let mut accepted = 0usize;
        let mut rejected = 0usize;

        let fail = |step: usize, t: f64, fevals: usize, reason| DiffusionError::Integration {
            step,
            sigma: t,
            fevals,
            reason,
        };

        while (t1 - t) * direction > 0.0 {
            let dt = direction * h.min((t1 - t).abs());
            if t + dt == t {
                return Err(fail(accepted, t, f.fevals, IntegrationFailure::StepUnderflow));
            }

            let y2 = y.lin_comb(1.0, &[(dt * A21, &k1)]);
            let k2 = f.eval(t + C2 * dt, &y2)?;
            let y3 = y.lin_comb(1.0, &[(dt * A31, &k1), (dt * A32, &k2)]);
            let k3 = f.eval(t + C3 * dt, &y3)?;
            let y4 = y.lin_comb(1.0, &[(dt * A41, &k1), (dt * A42, &k2), (dt * A43, &k3)]);
            let k4 = f.eval(t + C4 * dt, &y4)?;
            let y5 = y.lin_comb(
                1.0,
                &[(dt * A51, &k1), (dt * A52, &k2), (dt * A53, &k3), (dt * A54, &k4)],
            );
            let k5 = f.eval(t + C5 * dt, &y5)?;
            let y6 = y.lin_comb(
                1.0,
                &[
                    (dt * A61, &k1),
                    (dt * A62, &k2),
                    (dt * A63, &k3),
                    (dt * A64, &k4),
                    (dt * A65, &k5),
                ],
            );
            let k6 = f.eval(t + dt, &y6)?;
            let y_new = y.lin_comb(
                1.0,
                &[
                    (dt * B1, &k1),
                    (dt * B3, &k3),
                    (dt * B4, &k4),
                    (dt * B5, &k5),
                    (dt * B6, &k6),
                ],
            );
            let k7 = f.eval(t + dt, &y_new)?;

            let err = k1.lin_comb(
                dt * E1,
                &[
                    (dt * E3, &k3),
                    (dt * E4, &k4),
                    (dt * E5, &k5),
                    (dt * E6, &k6),
                    (dt * E7, &k7),
                ],
            );
            let ratio = err.scaled_norm(&y, Some(&y_new), atol, rtol)?;
            if !ratio.is_finite() {
                return Err(fail(accepted, t, f.fevals, IntegrationFailure::NonFinite));
            }

            let accept = ratio <= 1.0;
            let factor = if ratio == 0.0 {
                IFACTOR
            } else {
                let dfactor = if accept { 1.0 } else { DFACTOR };
                (SAFETY / ratio.powf(1.0 / ORDER)).max(dfactor).min(IFACTOR)
            };

            if accept {
                tracing::debug!(
                    step = accepted,
                    t,
                    dt,
                    ratio,
                    fevals = f.fevals,
                    "ode step accepted"
                );
                t += dt;
                y = y_new;
                k1 = k7;
                accepted += 1;
            } else {
                tracing::debug!(
                    step = accepted,
                    t,
                    dt,
                    ratio,
                    fevals = f.fevals,
                    "ode step rejected"
                );
                rejected += 1;
            }
            h = dt.abs() * factor;
        }

        Ok(OdeSolution {
            state: y,
            fevals: f.fevals,
            accepted_steps: accepted,
            rejected_steps: rejected,
        })
    }

    /// Hairer, Nørsett & Wanner (1993), II.4 starting step size
    fn initial_step<S, F>(&self, f: &mut Counted<F>, t0: f64, y0: &S, f0: &S) -> Result<f64>
    where
        S: OdeState,
        F: FnMut(f64, &S) -> Result<S>,
    {
        let OdeConfig { atol, rtol, .. } = self.config;

        let d0 = y0.scaled_norm(y0, None, atol, rtol)?;
        let d1 = f0.scaled_norm(y0, None, atol, rtol)?;
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };

        let y1 = y0.lin_comb(1.0, &[(h0, f0)]);
        let f1 = f.eval(t0 + h0, &y1)?;
        let d2 = f1.lin_comb(1.0, &[(-1.0, f0)]).scaled_norm(y0, None, atol, rtol)? / h0;

        let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(1.0 / ORDER)
        };
        let h = (100.0 * h0).min(h1);
        if h.is_finite() && h > 0.0 {
            Ok(h)
        } else {
            Err(DiffusionError::Integration {
                step: 0,
                sigma: t0,
                fevals: f.fevals,
                reason: IntegrationFailure::NonFinite,
            })
        }
    }
}
