use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::context::{Context, Flag};
use crate::dataset::{Attribute, Event, Obs, Sequence};
use crate::evaluator::Evaluator;
use crate::model::Model;
use crate::params::{BOUNDARY, OUT_OF_ALPHABET};
use crate::reader::parse_token;
use crate::Result;

/// Sentinel rendered for test-time labels outside the model's alphabet.
pub const OUT_OF_CLASS: &str = "!OUT_OF_CLASS!";

/// Per-position score attached to a decoded label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceMode {
    /// Normalized local score `R·M2 / Σ R·M2` along the decoded path.
    ///
    /// This is the classic approximation: it conditions on the decoded
    /// previous label and does not marginalize over the rest of the
    /// sequence.
    Local,
    /// True posterior marginal `α·β / Z` of the decoded label
    Marginal,
}

/// Evaluation summary for a labeled test file.
#[derive(Debug, Clone, Copy)]
pub struct TestReport {
    pub sequences: usize,
    pub accuracy: f64,
    /// (precision, recall, f1)
    pub micro_f1: (f64, f64, f64),
    pub macro_f1: (f64, f64, f64),
}

/// Predicts label sequences for input sequences using a trained model.
#[derive(Debug, Clone)]
pub struct Tagger<'a> {
    model: &'a Model,
    ctx: Context,
}

impl<'a> Tagger<'a> {
    pub(crate) fn new(model: &'a Model) -> Self {
        let mut ctx = Context::new(
            Flag::VITERBI | Flag::MARGINALS,
            model.params().num_labels(),
            0,
        );
        // Transition potentials depend on the weights only
        ctx.compute_edge(model.params());
        Self { model, ctx }
    }

    /// Predict the label sequence for a sequence of named attributes.
    ///
    /// Attributes outside the model's observation alphabet are ignored.
    pub fn tag<T: AsRef<[Attribute]>>(&mut self, xseq: &[T]) -> Result<Vec<&'a str>> {
        if xseq.is_empty() {
            return Ok(Vec::new());
        }
        let params = self.model.params();
        let seq: Sequence = xseq
            .iter()
            .map(|item| {
                let mut ev = Event::new(BOUNDARY, 1.0);
                ev.obs = item
                    .as_ref()
                    .iter()
                    .filter_map(|attr| {
                        params
                            .obs_id(&attr.name)
                            .map(|id| Obs::new(id, attr.value))
                    })
                    .collect();
                ev
            })
            .collect();

        let (ids, _score) = self.tag_ids(&seq);
        Ok(ids
            .iter()
            .map(|&id| self.model.params().label_str(id).unwrap_or(OUT_OF_CLASS))
            .collect())
    }

    /// Predict label ids for an id-space sequence; returns the decoded
    /// sequence and its unnormalized Viterbi score.
    pub fn tag_ids(&mut self, seq: &Sequence) -> (Vec<u32>, f64) {
        self.ctx.compute_factors(seq, self.model.params());
        self.ctx.viterbi()
    }

    /// Local confidences along a decoded path: `R·M2 / Σ_y R·M2`, with no
    /// transition factor at the first position.
    ///
    /// Call after [`tag_ids`](Self::tag_ids) with the labels it returned.
    pub fn confidences(&self, labels: &[u32]) -> Vec<f64> {
        let l = self.ctx.num_labels();
        let mut out = Vec::with_capacity(labels.len());
        let mut prev = BOUNDARY as usize;
        for (i, &y) in labels.iter().enumerate() {
            let mut norm = 0.0;
            for j in 1..l {
                let tran = if i > 0 { self.ctx.m2_at(prev, j) } else { 1.0 };
                norm += self.ctx.r_at(i, j) * tran;
            }
            let tran = if i > 0 {
                self.ctx.m2_at(prev, y as usize)
            } else {
                1.0
            };
            out.push(self.ctx.r_at(i, y as usize) * tran / norm);
            prev = y as usize;
        }
        out
    }

    /// True posterior marginals of the given labels, one per position.
    ///
    /// Runs the forward/backward recursions over the factors computed by
    /// the last [`tag_ids`](Self::tag_ids) call.
    pub fn marginals(&mut self, labels: &[u32]) -> Vec<f64> {
        let params = self.model.params();
        self.ctx.forward(params);
        self.ctx.backward(params);
        self.ctx.compute_scale_products();
        labels
            .iter()
            .enumerate()
            .map(|(i, &y)| self.ctx.marginal(i, y as usize))
            .collect()
    }

    /// Tag a labeled test file, optionally writing predictions.
    ///
    /// Output is one label per line with an optional confidence column
    /// and a blank line between sequences. Reference labels outside the
    /// alphabet render as [`OUT_OF_CLASS`] in evaluation and never fail.
    pub fn tag_file(
        &mut self,
        input: &Path,
        output: Option<&Path>,
        confidence: Option<ConfidenceMode>,
    ) -> Result<TestReport> {
        let params = self.model.params();
        let file = File::open(input)?;
        let mut out = match output {
            Some(path) => Some(BufWriter::new(File::create(path)?)),
            None => None,
        };

        let mut eval = Evaluator::new(params.num_labels());
        let mut sequences = 0usize;
        let mut seq = Sequence::new();
        let mut lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;
        // A trailing unterminated sequence still gets processed
        lines.push(String::new());

        for line in &lines {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some(first) => {
                    let (label, fval) = parse_token(first);
                    let label = params.label_id(label).unwrap_or(OUT_OF_ALPHABET);
                    let mut ev = Event::new(label, fval);
                    for tok in tokens {
                        let (name, value) = parse_token(tok);
                        if let Some(oid) = params.obs_id(name) {
                            ev.obs.push(Obs::new(oid, value));
                        }
                    }
                    seq.push(ev);
                }
                None => {
                    if seq.is_empty() {
                        continue;
                    }
                    let taken = std::mem::take(&mut seq);
                    let (hyp, _score) = self.tag_ids(&taken);
                    let scores = match confidence {
                        Some(ConfidenceMode::Local) => Some(self.confidences(&hyp)),
                        Some(ConfidenceMode::Marginal) => Some(self.marginals(&hyp)),
                        None => None,
                    };

                    if let Some(out) = out.as_mut() {
                        for (i, &y) in hyp.iter().enumerate() {
                            let name = params.label_str(y).unwrap_or(OUT_OF_CLASS);
                            match &scores {
                                Some(scores) => writeln!(out, "{name} {}", scores[i])?,
                                None => writeln!(out, "{name}")?,
                            }
                        }
                        writeln!(out)?;
                    }

                    let reference: Vec<u32> = taken.iter().map(|ev| ev.label).collect();
                    eval.append(&reference, &hyp, 1.0);
                    sequences += 1;
                }
            }
        }
        if let Some(mut out) = out {
            out.flush()?;
        }

        let report = TestReport {
            sequences,
            accuracy: eval.accuracy(),
            micro_f1: eval.micro_f1(),
            macro_f1: eval.macro_f1(),
        };
        info!(
            sequences,
            accuracy = report.accuracy,
            micro_f1 = report.micro_f1.2,
            "test file tagged"
        );
        Ok(report)
    }
}
