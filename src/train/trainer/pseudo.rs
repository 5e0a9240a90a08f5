use std::time::Instant;

use tracing::{info, warn};

use super::super::lbfgs::Lbfgs;
use super::{apply_regularization, report_iteration, Regularizer, Trainer};
use crate::error::{Error, Result};
use crate::evaluator::Evaluator;
use crate::params::BOUNDARY;

impl Trainer {
    /// Train by penalized pseudo-likelihood.
    ///
    /// Each position is a local softmax over the real labels conditioned
    /// on the *true* previous label (the boundary at position 0), so no
    /// lattice inference is needed. Shares the parameter table and the
    /// L-BFGS driver with [`train`](Self::train), which makes it a cheap
    /// warm-start before full training.
    pub fn pretrain(&mut self) -> Result<()> {
        self.finalize()?;
        let n = self.params.num_features();
        let l = self.params.num_labels();

        let mut lbfgs = Lbfgs::with_params(self.lbfgs_params()?);
        let mut eval = Evaluator::new(l);
        let dev_eval = Evaluator::new(l);
        let mut q = vec![0.0f64; l];
        let mut old_obj = 0.0f64;
        let mut converge = 0u32;

        info!(
            features = n,
            sequences = self.train_set.len(),
            regularizer = ?self.opts.regularizer,
            sigma = self.opts.sigma,
            "pretraining with pseudo-likelihood"
        );

        let started = Instant::now();
        for niter in 0..self.opts.max_iterations {
            let iter_started = Instant::now();
            let mut gradient = self.params.take_gradient();
            gradient.fill(0.0);
            eval.reset();

            let theta = self.params.weights();
            for (seq, count) in self.train_set.iter() {
                let mut prev = BOUNDARY;
                let mut reference = Vec::with_capacity(seq.len());
                let mut hypothesis = Vec::with_capacity(seq.len());

                for ev in seq {
                    // Scores for every real label given the true previous
                    q[..l].fill(0.0);
                    for ob in &ev.obs {
                        for &(y, fid) in self.params.param_refs(ob.id) {
                            q[y as usize] += theta[fid as usize] * ob.value;
                        }
                    }
                    for sp in self.params.state_index() {
                        if sp.y1 == prev {
                            q[sp.y2 as usize] += theta[sp.fid as usize] * sp.fval;
                        }
                    }

                    // Softmax over real labels; ties keep the lowest id
                    let max = q[1..l].iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    let mut sum = 0.0;
                    for item in q[1..l].iter_mut() {
                        *item = (*item - max).exp();
                        sum += *item;
                    }
                    let mut best = 1u32;
                    for y in 1..l {
                        q[y] /= sum;
                        if q[y] > q[best as usize] {
                            best = y as u32;
                        }
                    }

                    // Expected counts under the local distribution
                    for ob in &ev.obs {
                        for &(y, fid) in self.params.param_refs(ob.id) {
                            gradient[fid as usize] += q[y as usize] * ob.value * count;
                        }
                    }
                    for sp in self.params.state_index() {
                        if sp.y1 == prev {
                            gradient[sp.fid as usize] += q[sp.y2 as usize] * sp.fval * count;
                        }
                    }

                    // Empirical counts at the true label
                    for ob in &ev.obs {
                        if let Some(fid) = self.params.find_feature(ob.id, ev.label) {
                            gradient[fid as usize] -= ob.value * count;
                        }
                    }
                    if prev != BOUNDARY {
                        if let Some(fid) = self.params.trans_fid(prev, ev.label) {
                            gradient[fid as usize] -= ev.fval * count;
                        }
                    }

                    let logq = q[ev.label as usize].ln();
                    if !logq.is_finite() {
                        self.numeric_warnings += 1;
                        warn!("non-finite local log-likelihood");
                    }
                    eval.add_log_likelihood(count * logq);

                    reference.push(ev.label);
                    hypothesis.push(best);
                    prev = ev.label;
                }
                eval.append(&reference, &hypothesis, count);
            }

            apply_regularization(&self.opts, self.params.weights(), &mut gradient, &mut eval);
            let obj = eval.objective();

            let diff = if niter == 0 {
                1.0
            } else {
                (old_obj - obj).abs() / old_obj.abs().max(1e-300)
            };
            if diff < self.opts.eta {
                converge += 1;
            } else {
                converge = 0;
            }
            old_obj = obj;
            if converge == 3 {
                self.params.restore_gradient(gradient);
                info!(niter, "converged: objective change below eta");
                break;
            }

            let l1 = self.opts.regularizer == Regularizer::L1;
            let ret = lbfgs.optimize(
                self.params.weights_mut(),
                obj,
                &gradient,
                l1,
                self.opts.sigma,
            );
            self.params.restore_gradient(gradient);
            if ret < 0 {
                return Err(Error::Optimizer(format!(
                    "L-BFGS failed at pretrain iteration {niter}"
                )));
            }

            report_iteration(niter, &eval, &dev_eval, false, iter_started);
            if ret == 0 {
                info!(niter, "converged: optimizer criterion met");
                break;
            }
        }
        info!(elapsed = ?started.elapsed(), "pretraining finished");
        Ok(())
    }
}
