use std::collections::VecDeque;

use tracing::debug;

use crate::error::{Error, Result};

/// L-BFGS driver parameters.
#[derive(Debug, Clone)]
pub struct LbfgsParams {
    num_memories: usize,
    epsilon: f64,
    max_linesearch: usize,
    ftol: f64,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        Self {
            num_memories: 6,
            epsilon: 1e-5,
            max_linesearch: 20,
            ftol: 1e-4,
        }
    }
}

impl LbfgsParams {
    pub fn num_memories(&self) -> usize {
        self.num_memories
    }

    pub fn set_num_memories(&mut self, num_memories: usize) -> Result<()> {
        if num_memories < 1 {
            return Err(Error::InvalidInput(
                "num_memories must be at least 1".to_string(),
            ));
        }
        self.num_memories = num_memories;
        Ok(())
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn set_epsilon(&mut self, epsilon: f64) -> Result<()> {
        if epsilon < 0.0 {
            return Err(Error::InvalidInput(
                "epsilon must be non-negative".to_string(),
            ));
        }
        self.epsilon = epsilon;
        Ok(())
    }

    pub fn max_linesearch(&self) -> usize {
        self.max_linesearch
    }

    pub fn set_max_linesearch(&mut self, max_linesearch: usize) -> Result<()> {
        if max_linesearch == 0 {
            return Err(Error::InvalidInput(
                "max_linesearch must be positive".to_string(),
            ));
        }
        self.max_linesearch = max_linesearch;
        Ok(())
    }
}

/// A curvature pair for the two-loop recursion.
#[derive(Debug, Clone)]
struct Correction {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Limited-memory BFGS driver with orthant-wise (OWL-QN) handling of an
/// L1 penalty.
///
/// The driver is invoked once per objective/gradient evaluation and
/// updates the weights in place; the backtracking line search runs across
/// successive calls. Return codes: negative on failure, 0 when the
/// internal gradient criterion declares convergence, positive to continue
/// with the weights moved to the next trial point.
///
/// With `l1` set, `sigma` is the inverse penalty strength: the caller
/// must fold `Σ|θ|/σ` into the objective but leave the gradient smooth;
/// the driver forms the pseudo-gradient, projects the search direction
/// onto its descent orthant and clips sign changes to zero.
#[derive(Debug, Default)]
pub struct Lbfgs {
    params: LbfgsParams,
    history: VecDeque<Correction>,
    x_prev: Vec<f64>,
    g_prev: Vec<f64>,
    pg_prev: Vec<f64>,
    f_prev: f64,
    dir: Vec<f64>,
    step: f64,
    ls: usize,
    pending: bool,
    iterations: usize,
}

impl Lbfgs {
    pub fn new() -> Self {
        Self::with_params(LbfgsParams::default())
    }

    pub fn with_params(params: LbfgsParams) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    /// Number of accepted quasi-Newton steps so far
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Advance the optimization by one evaluation.
    ///
    /// `x` is the point the caller evaluated `fx` and `g` at; on a
    /// positive return it holds the next point to evaluate.
    pub fn optimize(&mut self, x: &mut [f64], fx: f64, g: &[f64], l1: bool, sigma: f64) -> i32 {
        if !fx.is_finite() || g.iter().any(|v| !v.is_finite()) {
            self.pending = false;
            return -1;
        }
        let c = if l1 && sigma > 0.0 { 1.0 / sigma } else { 0.0 };
        let pg = pseudo_gradient(x, g, c);

        if !self.pending {
            // First evaluation: steepest-descent step, normalized
            if self.converged(x, &pg) {
                return 0;
            }
            self.dir = pg.iter().map(|v| -v).collect();
            self.step = 1.0 / norm(&self.dir);
            self.save_point(x, fx, g, pg);
            self.ls = 1;
            self.pending = true;
            self.take_step(x, c);
            return 1;
        }

        // Sufficient decrease over the step actually taken (projection
        // included), measured against the pseudo-gradient
        let dgtest: f64 = self
            .pg_prev
            .iter()
            .zip(x.iter().zip(self.x_prev.iter()))
            .map(|(pg, (xi, xp))| pg * (xi - xp))
            .sum();
        if fx > self.f_prev + self.params.ftol * dgtest {
            if self.ls >= self.params.max_linesearch {
                debug!(ls = self.ls, "line search exhausted");
                self.pending = false;
                return -1;
            }
            self.step *= 0.5;
            self.ls += 1;
            self.take_step(x, c);
            return 1;
        }

        // Accept the point and update the curvature history
        let s: Vec<f64> = x
            .iter()
            .zip(self.x_prev.iter())
            .map(|(xi, xp)| xi - xp)
            .collect();
        let y: Vec<f64> = g
            .iter()
            .zip(self.g_prev.iter())
            .map(|(gi, gp)| gi - gp)
            .collect();
        let ys = dot(&y, &s);
        if ys > 1e-10 {
            if self.history.len() >= self.params.num_memories {
                self.history.pop_front();
            }
            let rho = 1.0 / ys;
            self.history.push_back(Correction { s, y, rho });
        }
        self.iterations += 1;

        if self.converged(x, &pg) {
            self.pending = false;
            return 0;
        }

        self.dir = self.two_loop(&pg);
        if c > 0.0 {
            // Constrain the direction to the pseudo-gradient descent
            // orthant
            for (d, pgi) in self.dir.iter_mut().zip(pg.iter()) {
                if *d * *pgi > 0.0 {
                    *d = 0.0;
                }
            }
        }
        if dot(&self.dir, &pg) >= 0.0 {
            self.dir = pg.iter().map(|v| -v).collect();
        }
        self.save_point(x, fx, g, pg);
        self.step = 1.0;
        self.ls = 1;
        self.take_step(x, c);
        1
    }

    fn converged(&self, x: &[f64], pg: &[f64]) -> bool {
        norm(pg) / norm(x).max(1.0) < self.params.epsilon
    }

    fn save_point(&mut self, x: &[f64], fx: f64, g: &[f64], pg: Vec<f64>) {
        self.x_prev = x.to_vec();
        self.f_prev = fx;
        self.g_prev = g.to_vec();
        self.pg_prev = pg;
    }

    /// Move to `x_prev + step * dir`; with an L1 penalty, clip every
    /// component that would leave its orthant back to zero.
    fn take_step(&self, x: &mut [f64], c: f64) {
        for (i, xi) in x.iter_mut().enumerate() {
            *xi = self.x_prev[i] + self.step * self.dir[i];
        }
        if c > 0.0 {
            for (i, xi) in x.iter_mut().enumerate() {
                let orthant = if self.x_prev[i] != 0.0 {
                    self.x_prev[i].signum()
                } else {
                    -self.pg_prev[i].signum()
                };
                if *xi * orthant < 0.0 {
                    *xi = 0.0;
                }
            }
        }
    }

    /// Two-loop recursion: returns `-H·pg` with the usual `sᵀy / yᵀy`
    /// initial scaling.
    fn two_loop(&self, pg: &[f64]) -> Vec<f64> {
        let mut q = pg.to_vec();
        let mut alpha = vec![0.0; self.history.len()];
        for (idx, corr) in self.history.iter().enumerate().rev() {
            let a = corr.rho * dot(&corr.s, &q);
            alpha[idx] = a;
            for (qi, yi) in q.iter_mut().zip(corr.y.iter()) {
                *qi -= a * yi;
            }
        }
        if let Some(last) = self.history.back() {
            let gamma = dot(&last.s, &last.y) / dot(&last.y, &last.y);
            for qi in q.iter_mut() {
                *qi *= gamma;
            }
        }
        for (idx, corr) in self.history.iter().enumerate() {
            let b = corr.rho * dot(&corr.y, &q);
            for (qi, si) in q.iter_mut().zip(corr.s.iter()) {
                *qi += (alpha[idx] - b) * si;
            }
        }
        for qi in q.iter_mut() {
            *qi = -*qi;
        }
        q
    }
}

/// OWL-QN pseudo-gradient of `f(x) + c·|x|₁` from the smooth gradient.
fn pseudo_gradient(x: &[f64], g: &[f64], c: f64) -> Vec<f64> {
    if c == 0.0 {
        return g.to_vec();
    }
    x.iter()
        .zip(g.iter())
        .map(|(&xi, &gi)| {
            if xi > 0.0 {
                gi + c
            } else if xi < 0.0 {
                gi - c
            } else if gi + c < 0.0 {
                gi + c
            } else if gi - c > 0.0 {
                gi - c
            } else {
                0.0
            }
        })
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}
