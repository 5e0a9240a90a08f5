use std::io::{BufRead, Write};

use tracing::debug;

use crate::dictionary::Dictionary;
use crate::error::{Error, Result};

/// Reserved boundary symbol occupying label id 0.
///
/// It stands in for the virtual BOS/EOS state and can never be produced
/// by data; real labels start at id 1.
pub const BOUNDARY_LABEL: &str = "<bos>";

/// Label id of the boundary symbol.
pub const BOUNDARY: u32 = 0;

/// Sentinel id for test-time labels outside the alphabet.
pub const OUT_OF_ALPHABET: u32 = u32::MAX;

/// A state-transition feature record: `(y1, y2)` with its weight index.
#[derive(Debug, Clone, Copy)]
pub struct StateParam {
    /// Previous label
    pub y1: u32,
    /// Current label
    pub y2: u32,
    /// Weight index
    pub fid: u32,
    /// Feature value, 1.0 for indicator transitions
    pub fval: f64,
}

/// The parameter table: alphabets, feature index and weights.
///
/// Observation features are pairs `(observation, label)` mapped to dense
/// weight indices. Transition features enter the same table as synthetic
/// observations spelled `@<prev_label>`; [`build_state_transition_index`]
/// materializes them into a flat [`StateParam`] list with `Pred`/`Succ`
/// neighbor lists to accelerate the forward/backward inner loops.
///
/// [`build_state_transition_index`]: ParamTable::build_state_transition_index
#[derive(Debug, Clone, Default)]
pub struct ParamTable {
    labels: Dictionary,
    obs: Dictionary,
    /// obs id -> [(label id, weight index)]
    param_index: Vec<Vec<(u32, u32)>>,
    /// weight index -> (obs id, label id)
    features: Vec<(u32, u32)>,
    weights: Vec<f64>,
    gradient: Vec<f64>,
    /// Derived transition view, rebuilt by `build_state_transition_index`
    state_index: Vec<StateParam>,
    /// pred[y2] = all y1 with a bound transition into y2
    pred: Vec<Vec<u32>>,
    /// succ[y1] = all y2 with a bound transition out of y1
    succ: Vec<Vec<u32>>,
    /// Dense (y1, y2) -> weight index lookup
    trans_fid: Vec<Option<u32>>,
    frozen: bool,
}

impl ParamTable {
    /// Create an empty table with the boundary symbol at label id 0
    pub fn new() -> Self {
        let mut table = Self::default();
        table.labels.get_or_insert(BOUNDARY_LABEL);
        table
    }

    /// Number of labels, including the boundary symbol
    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    /// Number of observation strings
    pub fn num_obs(&self) -> usize {
        self.obs.len()
    }

    /// Number of features (weight vector length)
    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    /// Label alphabet
    pub fn labels(&self) -> &Dictionary {
        &self.labels
    }

    /// Observation alphabet
    pub fn observations(&self) -> &Dictionary {
        &self.obs
    }

    /// Whether `end_update` has frozen the table
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Intern a label string, assigning the next id on first sight
    pub fn add_label(&mut self, s: &str) -> u32 {
        debug_assert!(!self.frozen, "label alphabet is frozen");
        self.labels.get_or_insert(s)
    }

    /// Intern an observation string
    pub fn add_obs(&mut self, s: &str) -> u32 {
        debug_assert!(!self.frozen, "observation alphabet is frozen");
        let id = self.obs.get_or_insert(s);
        if self.param_index.len() <= id as usize {
            self.param_index.resize(id as usize + 1, Vec::new());
        }
        id
    }

    /// Look up a label id
    pub fn label_id(&self, s: &str) -> Option<u32> {
        self.labels.get(s)
    }

    /// Look up a label string
    pub fn label_str(&self, id: u32) -> Option<&str> {
        self.labels.get_name(id)
    }

    /// Look up an observation id
    pub fn obs_id(&self, s: &str) -> Option<u32> {
        self.obs.get(s)
    }

    /// Bind `(obs_id, label_id)` to a weight index; idempotent per pair
    pub fn bind_feature(&mut self, obs_id: u32, label_id: u32) -> u32 {
        debug_assert!(!self.frozen, "feature index is frozen");
        let refs = &mut self.param_index[obs_id as usize];
        if let Some(&(_, fid)) = refs.iter().find(|&&(y, _)| y == label_id) {
            return fid;
        }
        let fid = self.features.len() as u32;
        refs.push((label_id, fid));
        self.features.push((obs_id, label_id));
        fid
    }

    /// Find the weight index bound to `(obs_id, label_id)`, if any
    pub fn find_feature(&self, obs_id: u32, label_id: u32) -> Option<u32> {
        self.param_index
            .get(obs_id as usize)?
            .iter()
            .find(|&&(y, _)| y == label_id)
            .map(|&(_, fid)| fid)
    }

    /// Feature references for an observation: `[(label id, weight index)]`
    pub fn param_refs(&self, obs_id: u32) -> &[(u32, u32)] {
        self.param_index
            .get(obs_id as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Iterate over `(obs_id, label_id, weight)` in weight-index order
    pub fn feature_entries(&self) -> impl Iterator<Item = (u32, u32, f64)> + '_ {
        self.features
            .iter()
            .zip(self.weights.iter())
            .map(|(&(obs, label), &w)| (obs, label, w))
    }

    /// Freeze the alphabets and allocate the weight and gradient vectors
    pub fn end_update(&mut self) {
        if self.frozen {
            return;
        }
        let n = self.features.len();
        self.weights = vec![0.0; n];
        self.gradient = vec![0.0; n];
        self.param_index.resize(self.obs.len(), Vec::new());
        self.frozen = true;
        debug!(
            labels = self.labels.len(),
            observations = self.obs.len(),
            features = n,
            "parameter table frozen"
        );
    }

    /// Materialize the transition view over `@<label>` observations.
    ///
    /// Fills the flat `StateParam` list, the `Pred`/`Succ` neighbor lists
    /// and the dense `(y1, y2)` lookup. Must be re-run after loading a
    /// model; the view is not serialized.
    pub fn build_state_transition_index(&mut self) {
        let l = self.labels.len();
        self.state_index.clear();
        self.pred = vec![Vec::new(); l];
        self.succ = vec![Vec::new(); l];
        self.trans_fid = vec![None; l * l];

        for (name, oid) in self.obs.iter() {
            let Some(prev) = name.strip_prefix('@') else {
                continue;
            };
            let Some(y1) = self.labels.get(prev) else {
                continue;
            };
            for &(y2, fid) in &self.param_index[oid as usize] {
                self.state_index.push(StateParam {
                    y1,
                    y2,
                    fid,
                    fval: 1.0,
                });
                self.pred[y2 as usize].push(y1);
                self.succ[y1 as usize].push(y2);
                self.trans_fid[y1 as usize * l + y2 as usize] = Some(fid);
            }
        }
    }

    /// All bound transitions
    pub fn state_index(&self) -> &[StateParam] {
        &self.state_index
    }

    /// Labels with a bound transition into `y2`
    pub fn pred(&self, y2: usize) -> &[u32] {
        self.pred.get(y2).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Labels with a bound transition out of `y1`
    pub fn succ(&self, y1: usize) -> &[u32] {
        self.succ.get(y1).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Weight index of the transition `(y1, y2)`, if bound
    pub fn trans_fid(&self, y1: u32, y2: u32) -> Option<u32> {
        let l = self.labels.len();
        self.trans_fid
            .get(y1 as usize * l + y2 as usize)
            .copied()
            .flatten()
    }

    /// Weight vector
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Mutable weight vector (the driver updates it in place)
    pub fn weights_mut(&mut self) -> &mut [f64] {
        &mut self.weights
    }

    /// Gradient vector
    pub fn gradient(&self) -> &[f64] {
        &self.gradient
    }

    /// Move the gradient vector out for a gradient pass.
    ///
    /// Lets the pass hold `&self` and the mutable gradient at once;
    /// hand it back with [`restore_gradient`](Self::restore_gradient).
    pub fn take_gradient(&mut self) -> Vec<f64> {
        std::mem::take(&mut self.gradient)
    }

    /// Return a gradient vector taken with `take_gradient`
    pub fn restore_gradient(&mut self, gradient: Vec<f64>) {
        debug_assert_eq!(gradient.len(), self.weights.len());
        self.gradient = gradient;
    }

    /// Write the alphabets, feature index and weights.
    ///
    /// The body is deterministic: label alphabet, observation alphabet,
    /// then one `obs_id label_id` line per weight index and one weight per
    /// line with 20 significant digits, enough to round-trip `f64` exactly.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(w, "{}", self.labels.len())?;
        for (name, _) in self.labels.iter() {
            writeln!(w, "{name}")?;
        }
        writeln!(w, "{}", self.obs.len())?;
        for (name, _) in self.obs.iter() {
            writeln!(w, "{name}")?;
        }
        writeln!(w, "{}", self.features.len())?;
        for &(obs, label) in &self.features {
            writeln!(w, "{obs} {label}")?;
        }
        for &weight in &self.weights {
            writeln!(w, "{weight:.20e}")?;
        }
        Ok(())
    }

    /// Read a table written by [`save`](Self::save).
    ///
    /// Ids are reconstructed in file order, so they match the saved table
    /// exactly. The caller re-runs `build_state_transition_index`.
    pub fn load<R: BufRead>(r: &mut R) -> Result<Self> {
        let mut lines = r.lines();
        let mut next = move || -> Result<String> {
            lines
                .next()
                .transpose()?
                .ok_or_else(|| Error::Format("unexpected end of model file".to_string()))
        };

        let mut table = Self::default();
        let num_labels: usize = parse_count(&next()?, "label count")?;
        for i in 0..num_labels {
            let name = next()?;
            if i == 0 && name != BOUNDARY_LABEL {
                return Err(Error::Format(format!(
                    "model does not reserve the boundary symbol: {name}"
                )));
            }
            table.labels.get_or_insert(&name);
        }
        if table.labels.len() != num_labels {
            return Err(Error::Format("duplicate label in model file".to_string()));
        }

        let num_obs: usize = parse_count(&next()?, "observation count")?;
        for _ in 0..num_obs {
            table.obs.get_or_insert(&next()?);
        }
        if table.obs.len() != num_obs {
            return Err(Error::Format(
                "duplicate observation in model file".to_string(),
            ));
        }
        table.param_index = vec![Vec::new(); num_obs];

        let num_features: usize = parse_count(&next()?, "feature count")?;
        for fid in 0..num_features {
            let line = next()?;
            let mut it = line.split_whitespace();
            let (Some(obs), Some(label), None) = (it.next(), it.next(), it.next()) else {
                return Err(Error::Format(format!("malformed feature line: {line}")));
            };
            let obs: u32 = parse_count(obs, "feature observation id")? as u32;
            let label: u32 = parse_count(label, "feature label id")? as u32;
            if obs as usize >= num_obs || label as usize >= num_labels {
                return Err(Error::Format(format!(
                    "feature id out of range: {obs} {label}"
                )));
            }
            table.param_index[obs as usize].push((label, fid as u32));
            table.features.push((obs, label));
        }

        table.weights = Vec::with_capacity(num_features);
        for _ in 0..num_features {
            let line = next()?;
            let weight: f64 = line
                .trim()
                .parse()
                .map_err(|_| Error::Format(format!("malformed weight line: {line}")))?;
            table.weights.push(weight);
        }
        table.gradient = vec![0.0; num_features];
        table.frozen = true;
        Ok(table)
    }
}

fn parse_count(s: &str, what: &str) -> Result<usize> {
    s.trim()
        .parse()
        .map_err(|_| Error::Format(format!("malformed {what}: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_table() -> ParamTable {
        let mut table = ParamTable::new();
        let a = table.add_label("A");
        let b = table.add_label("B");
        let wa = table.add_obs("w=a");
        let wb = table.add_obs("w=b");
        table.bind_feature(wa, a);
        table.bind_feature(wb, b);
        let ta = table.add_obs("@A");
        table.bind_feature(ta, a);
        table.bind_feature(ta, b);
        table.end_update();
        table.build_state_transition_index();
        table
    }

    #[test]
    fn test_boundary_reserved() {
        let table = ParamTable::new();
        assert_eq!(table.label_id(BOUNDARY_LABEL), Some(BOUNDARY));
        assert_eq!(table.num_labels(), 1);
    }

    #[test]
    fn test_bind_feature_idempotent() {
        let mut table = ParamTable::new();
        let a = table.add_label("A");
        let o = table.add_obs("w");
        let fid = table.bind_feature(o, a);
        assert_eq!(table.bind_feature(o, a), fid);
        assert_eq!(table.num_features(), 1);
    }

    #[test]
    fn test_state_transition_index() {
        let table = toy_table();
        assert_eq!(table.state_index().len(), 2);
        let a = table.label_id("A").unwrap();
        let b = table.label_id("B").unwrap();
        assert_eq!(table.pred(b as usize), &[a]);
        assert_eq!(table.succ(a as usize).len(), 2);
        assert!(table.trans_fid(a, b).is_some());
        assert!(table.trans_fid(b, a).is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut table = toy_table();
        for (i, w) in table.weights_mut().iter_mut().enumerate() {
            *w = (i as f64 + 1.0) * 0.12345678901234567;
        }
        let mut buf = Vec::new();
        table.save(&mut buf).unwrap();

        let mut loaded = ParamTable::load(&mut buf.as_slice()).unwrap();
        loaded.build_state_transition_index();

        assert_eq!(loaded.num_labels(), table.num_labels());
        assert_eq!(loaded.num_obs(), table.num_obs());
        assert_eq!(loaded.num_features(), table.num_features());
        assert_eq!(loaded.weights(), table.weights());
        assert_eq!(loaded.state_index().len(), table.state_index().len());
        assert_eq!(loaded.label_id("B"), table.label_id("B"));
        assert_eq!(loaded.obs_id("@A"), table.obs_id("@A"));
    }

    #[test]
    fn test_load_rejects_truncation() {
        let mut table = toy_table();
        table.weights_mut()[0] = 1.5;
        let mut buf = Vec::new();
        table.save(&mut buf).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(ParamTable::load(&mut buf.as_slice()).is_err());
    }
}
