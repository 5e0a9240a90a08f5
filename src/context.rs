use bitflags::bitflags;
use ndarray::{s, Array1, Array2};

use crate::dataset::Sequence;
use crate::params::{ParamTable, BOUNDARY};

bitflags! {
    /// Functionality flags selecting which context buffers are allocated
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flag: u32 {
        /// Viterbi score and backtrace matrices
        const VITERBI = 0x01;
        /// Backward messages and scale-product buffers for marginals
        const MARGINALS = 0x02;
        const ALL = 0xff;
    }
}

/// Per-sequence workspace for the CRF lattice.
///
/// Holds the observation potentials `R`, the transition potentials `M2`,
/// the rescaled forward/backward messages with their two scale vectors,
/// and the Viterbi score/backtrace matrices. Buffers grow to the longest
/// sequence seen and are reused across sequences.
///
/// Positions run 0..T-1 plus a virtual terminal position T carrying the
/// boundary label. Label id 0 is the reserved boundary state and is
/// excluded from every state enumeration; it only appears at the virtual
/// terminal entries of `alpha` and `beta`.
#[derive(Debug, Clone)]
pub struct Context {
    flag: Flag,
    /// Total number of labels, including the boundary at index 0
    num_labels: usize,
    /// Rows in use: sequence length + 1 (virtual terminal)
    num_items: usize,
    cap_items: usize,
    /// Observation potentials, `[T+1][L]`, all-ones baseline
    r: Array2<f64>,
    /// Transition potentials, `[L][L]`, exp of summed transition weights
    m2: Array2<f64>,
    /// Rescaled forward messages, `[T+1][L]`
    alpha: Array2<f64>,
    /// Rescaled backward messages, `[T+1][L]`
    beta: Array2<f64>,
    /// Forward scale factors: `scale[i]` is the alpha row sum at i
    scale: Array1<f64>,
    /// Backward scale factors
    scale2: Array1<f64>,
    /// Suffix products `prod_scale[i] = prod(scale[i..])`
    prod_scale: Array1<f64>,
    /// Suffix products of `scale2`
    prod_scale2: Array1<f64>,
    /// Viterbi prefix scores, `[T+1][L]`
    delta: Array2<f64>,
    /// Viterbi argmax predecessors
    psi: Array2<u32>,
}

impl Context {
    /// Create a workspace for `num_labels` labels.
    ///
    /// `hint` pre-sizes the buffers for sequences up to that length.
    pub fn new(flag: Flag, num_labels: usize, hint: usize) -> Self {
        let mut ctx = Self {
            flag,
            num_labels,
            num_items: 0,
            cap_items: 0,
            r: Array2::zeros((0, 0)),
            m2: Array2::ones((num_labels, num_labels)),
            alpha: Array2::zeros((0, 0)),
            beta: Array2::zeros((0, 0)),
            scale: Array1::zeros(0),
            scale2: Array1::zeros(0),
            prod_scale: Array1::zeros(0),
            prod_scale2: Array1::zeros(0),
            delta: Array2::zeros((0, 0)),
            psi: Array2::zeros((0, 0)),
        };
        if hint > 0 {
            ctx.grow(hint + 1);
        }
        ctx
    }

    /// Number of labels, including the boundary
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Rows in use: sequence length plus the virtual terminal
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    fn grow(&mut self, items: usize) {
        if items <= self.cap_items {
            return;
        }
        let l = self.num_labels;
        self.r = Array2::zeros((items, l));
        self.alpha = Array2::zeros((items, l));
        self.scale = Array1::zeros(items);
        if self.flag.contains(Flag::MARGINALS) {
            self.beta = Array2::zeros((items, l));
            self.scale2 = Array1::zeros(items);
            self.prod_scale = Array1::zeros(items);
            self.prod_scale2 = Array1::zeros(items);
        }
        if self.flag.contains(Flag::VITERBI) {
            self.delta = Array2::zeros((items, l));
            self.psi = Array2::zeros((items, l));
        }
        self.cap_items = items;
    }

    /// Recompute the transition potential matrix from the current weights.
    ///
    /// `M2` is sequence-independent; recompute it once per iteration (or
    /// once per tagging session), not per sequence. Unbound transitions
    /// keep the exp(0) = 1 baseline.
    pub fn compute_edge(&mut self, table: &ParamTable) {
        let theta = table.weights();
        self.m2.fill(1.0);
        for sp in table.state_index() {
            self.m2[[sp.y1 as usize, sp.y2 as usize]] *=
                (theta[sp.fid as usize] * sp.fval).exp();
        }
    }

    /// Compute the observation potentials `R` for one sequence.
    ///
    /// Rows are reset to the all-ones baseline and per-feature
    /// contributions multiplied in; the virtual terminal row stays 1.
    pub fn compute_factors(&mut self, seq: &Sequence, table: &ParamTable) {
        self.num_items = seq.len() + 1;
        self.grow(self.num_items);
        let theta = table.weights();
        self.r.slice_mut(s![..self.num_items, ..]).fill(1.0);
        for (i, ev) in seq.iter().enumerate() {
            for ob in &ev.obs {
                for &(y, fid) in table.param_refs(ob.id) {
                    self.r[[i, y as usize]] *= (theta[fid as usize] * ob.value).exp();
                }
            }
        }
    }

    /// Forward recursion with per-position rescaling.
    ///
    /// Uses the factored form: since `M2` is 1 everywhere except on bound
    /// transitions and each rescaled alpha row sums to 1, the all-ones
    /// contribution collapses to the `R` factor and the inner loop only
    /// visits the `Pred` neighbor list with `M2 - 1` corrections.
    pub fn forward(&mut self, table: &ParamTable) {
        let t1 = self.num_items;
        let l = self.num_labels;
        self.alpha.slice_mut(s![..t1, ..]).fill(0.0);
        self.scale.slice_mut(s![..t1]).fill(1.0);

        let mut sum = 0.0;
        for y in 1..l {
            // BOS -> y transition is 1
            let v = self.r[[0, y]];
            self.alpha[[0, y]] = v;
            sum += v;
        }
        for y in 1..l {
            self.alpha[[0, y]] /= sum;
        }
        self.scale[0] = sum;

        for i in 1..t1 - 1 {
            let mut sum = 0.0;
            for y in 1..l {
                let mut acc = 0.0;
                for &k in table.pred(y) {
                    acc += self.alpha[[i - 1, k as usize]] * (self.m2[[k as usize, y]] - 1.0);
                }
                let v = self.r[[i, y]] * (1.0 + acc);
                self.alpha[[i, y]] = v;
                sum += v;
            }
            for y in 1..l {
                self.alpha[[i, y]] /= sum;
            }
            self.scale[i] = sum;
        }

        // Virtual terminal: collect into the boundary state, unnormalized
        let mut z = 0.0;
        for k in 1..l {
            z += self.alpha[[t1 - 2, k]];
        }
        self.alpha[[t1 - 1, BOUNDARY as usize]] = z;
        self.scale[t1 - 1] = z;
    }

    /// Backward recursion mirroring [`forward`](Self::forward) over the
    /// `Succ` neighbor lists, with its own scale vector.
    pub fn backward(&mut self, table: &ParamTable) {
        let t1 = self.num_items;
        let l = self.num_labels;
        self.beta.slice_mut(s![..t1, ..]).fill(0.0);
        self.scale2.slice_mut(s![..t1]).fill(1.0);

        self.beta[[t1 - 1, BOUNDARY as usize]] = 1.0;

        // y -> EOS transition is 1 for every real label
        let mut sum = 0.0;
        for y in 1..l {
            self.beta[[t1 - 2, y]] = 1.0;
            sum += 1.0;
        }
        for y in 1..l {
            self.beta[[t1 - 2, y]] /= sum;
        }
        self.scale2[t1 - 2] = sum;

        for i in (1..t1 - 1).rev() {
            let mut constant = 0.0;
            for k in 1..l {
                constant += self.r[[i, k]] * self.beta[[i, k]];
            }
            let mut sum = 0.0;
            for y in 1..l {
                let mut acc = 0.0;
                for &k in table.succ(y) {
                    acc += self.r[[i, k as usize]]
                        * (self.m2[[y, k as usize]] - 1.0)
                        * self.beta[[i, k as usize]];
                }
                let v = acc + constant;
                self.beta[[i - 1, y]] = v;
                sum += v;
            }
            for y in 1..l {
                self.beta[[i - 1, y]] /= sum;
            }
            self.scale2[i - 1] = sum;
        }
    }

    /// Rebuild the suffix scale products consumed by the correction
    /// factors; call after `forward` and `backward`.
    pub fn compute_scale_products(&mut self) {
        let t1 = self.num_items;
        let mut prod = 1.0;
        for i in (0..t1).rev() {
            prod *= self.scale[i];
            self.prod_scale[i] = prod;
        }
        prod = 1.0;
        for i in (0..t1).rev() {
            prod *= self.scale2[i];
            self.prod_scale2[i] = prod;
        }
    }

    /// Partition value stored at the virtual terminal, before the final
    /// rescale. The true normalizer is this times the product of the
    /// forward scales.
    pub fn z(&self) -> f64 {
        self.alpha[[self.num_items - 1, BOUNDARY as usize]]
    }

    /// Log of the full partition function
    pub fn log_z(&self) -> f64 {
        (0..self.num_items).map(|i| self.scale[i].ln()).sum()
    }

    /// Log partition recomputed from the backward messages; agrees with
    /// [`log_z`](Self::log_z) up to floating error.
    pub fn backward_log_z(&self) -> f64 {
        let mut sum = 0.0;
        for y in 1..self.num_labels {
            sum += self.r[[0, y]] * self.beta[[0, y]];
        }
        sum.ln() + (0..self.num_items).map(|i| self.scale2[i].ln()).sum::<f64>()
    }

    /// Correction factor combining `alpha[i] * beta[i]` into a genuine
    /// probability
    pub fn scale_corr_obs(&self, i: usize) -> f64 {
        self.prod_scale2[i] / self.prod_scale[i + 1]
    }

    /// Correction factor for the transition marginal at position i
    pub fn scale_corr_trans(&self, i: usize) -> f64 {
        self.prod_scale2[i] / self.prod_scale[i]
    }

    /// Posterior marginal P(y at i) under the current factors
    pub fn marginal(&self, i: usize, y: usize) -> f64 {
        self.alpha[[i, y]] * self.beta[[i, y]] / self.z() * self.scale_corr_obs(i)
    }

    /// Observation potential at (i, y)
    pub fn r_at(&self, i: usize, y: usize) -> f64 {
        self.r[[i, y]]
    }

    /// Transition potential for (y1, y2)
    pub fn m2_at(&self, y1: usize, y2: usize) -> f64 {
        self.m2[[y1, y2]]
    }

    /// Rescaled forward message at (i, y)
    pub fn alpha_at(&self, i: usize, y: usize) -> f64 {
        self.alpha[[i, y]]
    }

    /// Rescaled backward message at (i, y)
    pub fn beta_at(&self, i: usize, y: usize) -> f64 {
        self.beta[[i, y]]
    }

    /// Probability of the labeled path under the current factors.
    ///
    /// Walks the true path multiplying `R` and `M2` while dividing out the
    /// running scales, which keeps the product in range for long
    /// sequences.
    pub fn sequence_prob(&self, seq: &Sequence) -> f64 {
        let t1 = self.num_items;
        let mut p = 1.0f64;
        let mut prev = BOUNDARY as usize;
        for i in 0..t1 {
            if i < t1 - 1 {
                let y = seq[i].label as usize;
                let tran = if i > 0 { self.m2[[prev, y]] } else { 1.0 };
                p *= self.r[[i, y]] * tran;
                prev = y;
            }
            p /= self.scale[i];
        }
        p / self.z()
    }

    /// Log-likelihood of the labeled path
    pub fn log_likelihood(&self, seq: &Sequence) -> f64 {
        self.sequence_prob(seq).ln()
    }

    /// Viterbi decoding: the argmax label sequence and its unnormalized
    /// path score.
    ///
    /// Ties break toward the lowest label id (strict `>`, first max kept).
    pub fn viterbi(&mut self) -> (Vec<u32>, f64) {
        let t1 = self.num_items;
        let t = t1 - 1;
        let l = self.num_labels;

        for y in 1..l {
            self.delta[[0, y]] = self.r[[0, y]];
            self.psi[[0, y]] = BOUNDARY;
        }

        for i in 1..t {
            for y in 1..l {
                let mut max = f64::NEG_INFINITY;
                let mut argmax = 1u32;
                for k in 1..l {
                    let val = self.delta[[i - 1, k]] * self.m2[[k, y]];
                    if val > max {
                        max = val;
                        argmax = k as u32;
                    }
                }
                self.delta[[i, y]] = max * self.r[[i, y]];
                self.psi[[i, y]] = argmax;
            }
        }

        // Virtual transition to the boundary at the terminal
        let mut max = f64::NEG_INFINITY;
        let mut argmax = 1u32;
        for k in 1..l {
            let val = self.delta[[t - 1, k]];
            if val > max {
                max = val;
                argmax = k as u32;
            }
        }
        self.delta[[t, BOUNDARY as usize]] = max;
        self.psi[[t, BOUNDARY as usize]] = argmax;

        let mut labels = vec![BOUNDARY; t];
        let mut prev = BOUNDARY as usize;
        for i in (1..=t).rev() {
            let y = self.psi[[i, prev]];
            labels[i - 1] = y;
            prev = y as usize;
        }
        (labels, self.delta[[t, BOUNDARY as usize]])
    }

    /// Accumulate model-expected feature counts for one sequence.
    ///
    /// Requires `forward`, `backward` and `compute_scale_products`.
    pub fn expected_counts_into(&self, seq: &Sequence, table: &ParamTable, counts: &mut [f64]) {
        let z = self.z();
        for (i, ev) in seq.iter().enumerate() {
            let corr = self.scale_corr_obs(i);
            for ob in &ev.obs {
                for &(y, fid) in table.param_refs(ob.id) {
                    let y = y as usize;
                    let p = self.alpha[[i, y]] * self.beta[[i, y]] / z * corr;
                    counts[fid as usize] += p * ob.value;
                }
            }
            if i > 0 {
                let corr = self.scale_corr_trans(i);
                for sp in table.state_index() {
                    let (y1, y2) = (sp.y1 as usize, sp.y2 as usize);
                    let p = self.alpha[[i - 1, y1]]
                        * self.beta[[i, y2]]
                        * self.r[[i, y2]]
                        * self.m2[[y1, y2]]
                        / z
                        * corr;
                    counts[sp.fid as usize] += p * sp.fval;
                }
            }
        }
    }

    /// Accumulate empirical feature counts along the true label path.
    pub fn observed_counts_into(&self, seq: &Sequence, table: &ParamTable, counts: &mut [f64]) {
        let mut prev = None;
        for ev in seq {
            for ob in &ev.obs {
                if let Some(fid) = table.find_feature(ob.id, ev.label) {
                    counts[fid as usize] += ob.value;
                }
            }
            if let Some(prev) = prev {
                if let Some(fid) = table.trans_fid(prev, ev.label) {
                    counts[fid as usize] += ev.fval;
                }
            }
            prev = Some(ev.label);
        }
    }
}
