use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};
use crate::params::ParamTable;
use crate::tagger::Tagger;

/// A trained CRF model: the frozen parameter table plus text-format I/O.
#[derive(Debug, Clone)]
pub struct Model {
    params: ParamTable,
}

impl Model {
    /// Wrap a finalized parameter table, rebuilding the transition view
    pub fn new(mut params: ParamTable) -> Self {
        params.build_state_transition_index();
        Self { params }
    }

    /// The underlying parameter table
    pub fn params(&self) -> &ParamTable {
        &self.params
    }

    /// Create a tagger over this model
    pub fn tagger(&self) -> Tagger<'_> {
        Tagger::new(self)
    }

    /// Save the model in text format
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);
        write_header(&mut w)?;
        self.params.save(&mut w)?;
        w.flush()?;
        info!(path = %path.display(), "model saved");
        Ok(())
    }

    /// Load a model written by [`save`](Self::save).
    ///
    /// The header is validated: the second header line's second token
    /// must be `CRF`, and a lone `:` line must close the header.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut r = BufReader::new(file);
        read_header(&mut r)?;
        let mut params = ParamTable::load(&mut r)?;
        params.build_state_transition_index();
        info!(
            path = %path.display(),
            labels = params.num_labels(),
            features = params.num_features(),
            "model loaded"
        );
        Ok(Self { params })
    }
}

fn write_header<W: Write>(w: &mut W) -> Result<()> {
    writeln!(w, "# chaincrf: linear-chain conditional random fields")?;
    writeln!(w, "# CRF model file (text format)")?;
    writeln!(w, "# do not edit this file")?;
    writeln!(w, "#")?;
    writeln!(w, ":")?;
    Ok(())
}

fn read_header<R: BufRead>(r: &mut R) -> Result<()> {
    let mut count = 0usize;
    loop {
        let mut line = String::new();
        if r.read_line(&mut line)? == 0 {
            return Err(Error::Format("missing model header".to_string()));
        }
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            if count == 1 {
                let mut tok = line.split_whitespace();
                if tok.nth(1) != Some("CRF") {
                    return Err(Error::Format("invalid model file header".to_string()));
                }
            }
            count += 1;
            continue;
        }
        if line == ":" {
            return Ok(());
        }
        return Err(Error::Format(format!(
            "unexpected line in model header: {line}"
        )));
    }
}
