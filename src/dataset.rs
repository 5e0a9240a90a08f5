use std::collections::HashMap;
use std::fmt::Write as _;

/// A named observation feature with its value.
///
/// This type is used for both training and prediction (tagging); the
/// trainer interns names into the observation alphabet.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Feature name, e.g. `word=cat`
    pub name: String,
    /// Feature value
    pub value: f64,
}

impl Attribute {
    /// Create a new attribute with a name and value
    pub fn new<T: Into<String>>(name: T, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl From<&str> for Attribute {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: 1.0,
        }
    }
}

impl<S: Into<String>> From<(S, f64)> for Attribute {
    fn from((name, value): (S, f64)) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// An observation feature resolved to its alphabet id.
#[derive(Debug, Clone, Copy)]
pub struct Obs {
    /// Observation id
    pub id: u32,
    /// Feature value
    pub value: f64,
}

impl Obs {
    pub fn new(id: u32, value: f64) -> Self {
        Self { id, value }
    }
}

/// One token position: the observed label (or an out-of-alphabet sentinel
/// at test time) plus its sparse observation vector.
#[derive(Debug, Clone)]
pub struct Event {
    /// Label id
    pub label: u32,
    /// Label weight, 1.0 unless the data line carried `LABEL:weight`
    pub fval: f64,
    /// Sparse observation features
    pub obs: Vec<Obs>,
}

impl Event {
    pub fn new(label: u32, fval: f64) -> Self {
        Self {
            label,
            fval,
            obs: Vec::new(),
        }
    }
}

/// An ordered list of events.
pub type Sequence = Vec<Event>;

/// A collection of training or evaluation sequences.
///
/// Identical sequences coalesce into one entry with a multiplicity count,
/// so one forward-backward pass covers every duplicate.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    sequences: Vec<Sequence>,
    counts: Vec<f64>,
    index: HashMap<String, usize>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct sequences
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Total multiplicity over all distinct sequences
    pub fn total_count(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Length of the longest sequence, for workspace sizing
    pub fn max_len(&self) -> usize {
        self.sequences.iter().map(|s| s.len()).max().unwrap_or(0)
    }

    /// Append a sequence, merging it with an identical earlier one.
    ///
    /// Empty sequences (consecutive blank lines in a data file) are
    /// dropped.
    pub fn push(&mut self, seq: Sequence) {
        if seq.is_empty() {
            return;
        }
        let key = sequence_key(&seq);
        if let Some(&at) = self.index.get(&key) {
            self.counts[at] += 1.0;
        } else {
            self.index.insert(key, self.sequences.len());
            self.sequences.push(seq);
            self.counts.push(1.0);
        }
    }

    /// Iterate over (sequence, multiplicity) pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&Sequence, f64)> + '_ {
        self.sequences.iter().zip(self.counts.iter().copied())
    }

    pub fn clear(&mut self) {
        self.sequences.clear();
        self.counts.clear();
        self.index.clear();
    }
}

/// Exact identity key over label ids, observation ids and value bits.
fn sequence_key(seq: &Sequence) -> String {
    let mut key = String::new();
    for ev in seq {
        let _ = write!(key, "{}:{:x}", ev.label, ev.fval.to_bits());
        for ob in &ev.obs {
            let _ = write!(key, ",{}:{:x}", ob.id, ob.value.to_bits());
        }
        key.push(';');
    }
    key
}
