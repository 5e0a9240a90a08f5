use std::path::Path;
use std::time::Instant;

use tracing::{info, warn};

use super::lbfgs::{Lbfgs, LbfgsParams};
use crate::context::{Context, Flag};
use crate::dataset::{Attribute, Dataset, Event, Obs, Sequence};
use crate::error::{Error, Result};
use crate::evaluator::Evaluator;
use crate::model::Model;
use crate::params::ParamTable;
use crate::reader;

mod pseudo;

/// Penalty applied to the training objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Regularizer {
    /// No penalty
    None,
    /// `Σ|θ|/σ`, handled orthant-wise inside the driver
    L1,
    /// Gaussian prior `Σθ²/(2σ)` with σ as the variance
    #[default]
    L2,
}

/// Knobs for both training objectives.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    /// Maximum driver invocations per training run
    pub max_iterations: usize,
    /// Penalty scale: variance for L2, inverse strength for L1
    pub sigma: f64,
    pub regularizer: Regularizer,
    /// External convergence tolerance on the relative objective change
    pub eta: f64,
    /// L-BFGS history size
    pub num_memories: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            sigma: 10.0,
            regularizer: Regularizer::default(),
            eta: 1e-4,
            num_memories: 6,
        }
    }
}

/// CRF trainer: owns the parameter table, the training and development
/// sets and the lattice workspace.
///
/// Data enters either through [`append`](Self::append) or through the
/// file readers; [`train`](Self::train) runs the forward-backward
/// maximum-likelihood objective and [`pretrain`](Self::pretrain) the
/// pseudo-likelihood warm-start. Both drive the same weight vector, so a
/// pretrain/train handoff needs no copying.
#[derive(Debug)]
pub struct Trainer {
    params: ParamTable,
    train_set: Dataset,
    dev_set: Dataset,
    ctx: Option<Context>,
    opts: TrainOptions,
    numeric_warnings: u64,
}

impl Trainer {
    pub fn new() -> Self {
        Self::with_options(TrainOptions::default())
    }

    pub fn with_options(opts: TrainOptions) -> Self {
        Self {
            params: ParamTable::new(),
            train_set: Dataset::new(),
            dev_set: Dataset::new(),
            ctx: None,
            opts,
            numeric_warnings: 0,
        }
    }

    pub fn options(&self) -> &TrainOptions {
        &self.opts
    }

    pub fn options_mut(&mut self) -> &mut TrainOptions {
        &mut self.opts
    }

    /// The parameter table being fit
    pub fn params(&self) -> &ParamTable {
        &self.params
    }

    /// Count of non-finite intermediates observed during training
    pub fn numeric_warnings(&self) -> u64 {
        self.numeric_warnings
    }

    /// Append one training sequence of named attributes.
    pub fn append<I, L>(&mut self, xseq: &[I], yseq: &[L]) -> Result<()>
    where
        I: AsRef<[Attribute]>,
        L: AsRef<str>,
    {
        if xseq.len() != yseq.len() {
            return Err(Error::InvalidInput(
                "xseq and yseq must have the same length".to_string(),
            ));
        }
        if xseq.is_empty() {
            return Err(Error::InvalidInput(
                "empty sequences are not allowed".to_string(),
            ));
        }
        if self.params.is_frozen() {
            return Err(Error::InvalidInput(
                "cannot append after training has started".to_string(),
            ));
        }

        let mut seq = Sequence::with_capacity(xseq.len());
        for (item, label) in xseq.iter().zip(yseq.iter()) {
            let label = self.params.add_label(label.as_ref());
            let mut ev = Event::new(label, 1.0);
            for attr in item.as_ref() {
                let oid = self.params.add_obs(&attr.name);
                self.params.bind_feature(oid, label);
                ev.obs.push(Obs::new(oid, attr.value));
            }
            seq.push(ev);
        }
        self.train_set.push(seq);
        Ok(())
    }

    /// Load a training data file
    pub fn read_train(&mut self, path: &Path) -> Result<()> {
        if self.params.is_frozen() {
            return Err(Error::InvalidInput(
                "cannot load training data after training has started".to_string(),
            ));
        }
        reader::read_train_file(path, &mut self.params, &mut self.train_set)
    }

    /// Load a development data file, evaluated once per iteration
    pub fn read_dev(&mut self, path: &Path) -> Result<()> {
        reader::read_labeled_file(path, &self.params, &mut self.dev_set)
    }

    /// Synthesize transition features, freeze the table and size the
    /// workspace. Idempotent; runs automatically at the first training
    /// call.
    fn finalize(&mut self) -> Result<()> {
        if self.train_set.is_empty() {
            return Err(Error::InvalidInput("no training data".to_string()));
        }
        if !self.params.is_frozen() {
            // A transition observation `@<prev>` for every position i>=1,
            // bound to every real label now that the alphabet is complete
            let num_labels = self.params.num_labels() as u32;
            let mut prev_labels: Vec<u32> = Vec::new();
            for (seq, _) in self.train_set.iter() {
                for window in seq.windows(2) {
                    prev_labels.push(window[0].label);
                }
            }
            prev_labels.sort_unstable();
            prev_labels.dedup();
            for label in prev_labels {
                let name = format!("@{}", self.params.label_str(label).unwrap_or_default());
                let oid = self.params.add_obs(&name);
                for y in 1..num_labels {
                    self.params.bind_feature(oid, y);
                }
            }
            self.params.end_update();
            self.params.build_state_transition_index();
        }
        if self.ctx.is_none() {
            self.ctx = Some(Context::new(
                Flag::ALL,
                self.params.num_labels(),
                self.train_set.max_len().max(self.dev_set.max_len()),
            ));
        }
        Ok(())
    }

    /// Train by penalized maximum likelihood with forward-backward
    /// gradients and the L-BFGS driver.
    pub fn train(&mut self) -> Result<()> {
        self.finalize()?;
        let n = self.params.num_features();
        let l = self.params.num_labels();

        let mut lbfgs = Lbfgs::with_params(self.lbfgs_params()?);
        let mut eval = Evaluator::new(l);
        let mut dev_eval = Evaluator::new(l);
        let mut expected = vec![0.0; n];
        let mut observed = vec![0.0; n];
        let mut old_obj = 0.0f64;
        let mut converge = 0u32;

        info!(
            features = n,
            sequences = self.train_set.len(),
            regularizer = ?self.opts.regularizer,
            sigma = self.opts.sigma,
            "training with L-BFGS"
        );

        let started = Instant::now();
        for niter in 0..self.opts.max_iterations {
            let iter_started = Instant::now();
            let mut gradient = self.params.take_gradient();
            gradient.fill(0.0);
            eval.reset();

            let ctx = self.ctx.as_mut().expect("workspace sized in finalize");
            ctx.compute_edge(&self.params);

            for (seq, count) in self.train_set.iter() {
                ctx.compute_factors(seq, &self.params);
                ctx.forward(&self.params);
                ctx.backward(&self.params);
                ctx.compute_scale_products();

                let logp = ctx.log_likelihood(seq);
                if !logp.is_finite() {
                    self.numeric_warnings += 1;
                    warn!(length = seq.len(), "non-finite sequence log-likelihood");
                }
                eval.add_log_likelihood(count * logp);

                let (hypothesis, _) = ctx.viterbi();
                let reference: Vec<u32> = seq.iter().map(|ev| ev.label).collect();
                eval.append(&reference, &hypothesis, count);

                expected.fill(0.0);
                observed.fill(0.0);
                ctx.expected_counts_into(seq, &self.params, &mut expected);
                ctx.observed_counts_into(seq, &self.params, &mut observed);
                for i in 0..n {
                    gradient[i] += (expected[i] - observed[i]) * count;
                }
            }

            if !self.dev_set.is_empty() {
                dev_eval.reset();
                for (seq, count) in self.dev_set.iter() {
                    ctx.compute_factors(seq, &self.params);
                    let (hypothesis, _) = ctx.viterbi();
                    let reference: Vec<u32> = seq.iter().map(|ev| ev.label).collect();
                    dev_eval.append(&reference, &hypothesis, count);
                }
            }

            apply_regularization(&self.opts, self.params.weights(), &mut gradient, &mut eval);
            let obj = eval.objective();

            // External criterion: three consecutive small relative changes
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
                    "L-BFGS failed at iteration {niter}"
                )));
            }

            report_iteration(niter, &eval, &dev_eval, !self.dev_set.is_empty(), iter_started);
            if ret == 0 {
                info!(niter, "converged: optimizer criterion met");
                break;
            }
        }
        info!(elapsed = ?started.elapsed(), "training finished");
        Ok(())
    }

    fn lbfgs_params(&self) -> Result<LbfgsParams> {
        let mut params = LbfgsParams::default();
        params.set_num_memories(self.opts.num_memories)?;
        Ok(params)
    }

    /// Consume the trainer, producing a model over the fitted table
    pub fn into_model(mut self) -> Result<Model> {
        self.finalize()?;
        Ok(Model::new(self.params))
    }

    /// Save the fitted table without consuming the trainer
    pub fn save_model(&self, path: &Path) -> Result<()> {
        Model::new(self.params.clone()).save(path)
    }
}

impl Default for Trainer {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold the penalty into the objective and, for L2, the gradient; the
/// L1 subgradient is the driver's job.
pub(super) fn apply_regularization(
    opts: &TrainOptions,
    theta: &[f64],
    gradient: &mut [f64],
    eval: &mut Evaluator,
) {
    if opts.sigma <= 0.0 {
        return;
    }
    match opts.regularizer {
        Regularizer::None => {}
        Regularizer::L1 => {
            let penalty: f64 = theta.iter().map(|w| w.abs()).sum::<f64>() / opts.sigma;
            eval.sub_log_likelihood(penalty);
        }
        Regularizer::L2 => {
            let mut penalty = 0.0;
            for (g, &w) in gradient.iter_mut().zip(theta.iter()) {
                *g += w / opts.sigma;
                penalty += w * w / (2.0 * opts.sigma);
            }
            eval.sub_log_likelihood(penalty);
        }
    }
}

pub(super) fn report_iteration(
    niter: usize,
    eval: &Evaluator,
    dev_eval: &Evaluator,
    have_dev: bool,
    started: Instant,
) {
    let (_, _, micro) = eval.micro_f1();
    let (_, _, macro_) = eval.macro_f1();
    if have_dev {
        let (_, _, dev_micro) = dev_eval.micro_f1();
        info!(
            iter = niter,
            loglik = eval.log_likelihood(),
            acc = eval.accuracy(),
            micro_f1 = micro,
            macro_f1 = macro_,
            dev_acc = dev_eval.accuracy(),
            dev_micro_f1 = dev_micro,
            elapsed = ?started.elapsed(),
        );
    } else {
        info!(
            iter = niter,
            loglik = eval.log_likelihood(),
            acc = eval.accuracy(),
            micro_f1 = micro,
            macro_f1 = macro_,
            elapsed = ?started.elapsed(),
        );
    }
}
