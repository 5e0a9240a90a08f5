use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::info;

use crate::dataset::{Dataset, Event, Obs, Sequence};
use crate::params::{ParamTable, OUT_OF_ALPHABET};
use crate::Result;

/// Split a `name:value` token; the value defaults to 1.0 when absent or
/// unparsable (a bare `:` inside a feature name stays part of the name).
pub fn parse_token(tok: &str) -> (&str, f64) {
    if let Some((name, value)) = tok.rsplit_once(':') {
        if let Ok(value) = value.parse::<f64>() {
            return (name, value);
        }
    }
    (tok, 1.0)
}

/// Read a training file into `dataset`, growing the table's alphabets.
///
/// Each non-empty line is `LABEL[:weight] OBS[:value] ...`; a blank line
/// terminates a sequence. Labels are registered in a first pass so their
/// ids follow first-seen order; the second pass packs events and binds an
/// observation feature for every co-occurring (observation, label) pair.
/// Transition features are synthesized later, at finalization, once the
/// full label alphabet is known.
pub fn read_train_file(path: &Path, table: &mut ParamTable, dataset: &mut Dataset) -> Result<()> {
    let file = File::open(path)?;
    let lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;

    // Label alphabet first, in first-seen order
    for line in &lines {
        if let Some(tok) = line.split_whitespace().next() {
            let (label, _) = parse_token(tok);
            table.add_label(label);
        }
    }

    let before = dataset.len();
    let mut seq = Sequence::new();
    let mut count = 0usize;
    for line in &lines {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            None => {
                dataset.push(std::mem::take(&mut seq));
                count += 1;
            }
            Some(first) => {
                let (label, fval) = parse_token(first);
                let label = table.add_label(label);
                let mut ev = Event::new(label, fval);
                for tok in tokens {
                    let (name, value) = parse_token(tok);
                    let oid = table.add_obs(name);
                    table.bind_feature(oid, label);
                    ev.obs.push(Obs::new(oid, value));
                }
                seq.push(ev);
            }
        }
    }
    if !seq.is_empty() {
        dataset.push(seq);
        count += 1;
    }

    info!(
        path = %path.display(),
        sequences = count,
        distinct = dataset.len() - before,
        "training data loaded"
    );
    Ok(())
}

/// Read a dev or test file through frozen alphabets.
///
/// Unknown observations are dropped; unknown labels map to the
/// out-of-alphabet sentinel so evaluation can report them without
/// failing. No features are bound.
pub fn read_labeled_file(path: &Path, table: &ParamTable, dataset: &mut Dataset) -> Result<()> {
    let file = File::open(path)?;
    let before = dataset.len();
    let mut seq = Sequence::new();
    let mut count = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            None => {
                dataset.push(std::mem::take(&mut seq));
                count += 1;
            }
            Some(first) => {
                let (label, fval) = parse_token(first);
                let label = table.label_id(label).unwrap_or(OUT_OF_ALPHABET);
                let mut ev = Event::new(label, fval);
                for tok in tokens {
                    let (name, value) = parse_token(tok);
                    if let Some(oid) = table.obs_id(name) {
                        ev.obs.push(Obs::new(oid, value));
                    }
                }
                seq.push(ev);
            }
        }
    }
    if !seq.is_empty() {
        dataset.push(seq);
        count += 1;
    }

    info!(
        path = %path.display(),
        sequences = count,
        distinct = dataset.len() - before,
        "evaluation data loaded"
    );
    Ok(())
}
