//! Linear-chain conditional random fields for sequence labeling.
//!
//! This library provides training (penalized maximum likelihood with an
//! L-BFGS/OWL-QN driver, plus a pseudo-likelihood warm-start), Viterbi
//! tagging with confidence scores, and a text model format.
//!
//! # Examples
//!
//! ## Training
//!
//! ```no_run
//! use chaincrf::{Attribute, Trainer};
//!
//! let mut trainer = Trainer::new();
//!
//! let xseq = vec![
//!     vec![Attribute::new("walk", 1.0)],
//!     vec![Attribute::new("shop", 1.0)],
//! ];
//! let yseq = vec!["sunny", "rainy"];
//! trainer.append(&xseq, &yseq)?;
//!
//! trainer.train()?;
//! trainer.save_model("model.crf".as_ref())?;
//! # Ok::<(), chaincrf::Error>(())
//! ```
//!
//! ## Tagging
//!
//! ```no_run
//! use chaincrf::{Attribute, Model};
//!
//! let model = Model::load("model.crf".as_ref())?;
//! let mut tagger = model.tagger();
//!
//! let xseq = vec![
//!     vec![Attribute::new("walk", 1.0)],
//!     vec![Attribute::new("shop", 1.0)],
//! ];
//! let labels = tagger.tag(&xseq)?;
//! # Ok::<(), chaincrf::Error>(())
//! ```

mod context;
mod dataset;
mod dictionary;
mod error;
mod evaluator;
mod model;
mod params;
mod reader;
mod tagger;

/// Training module containing the objectives and the optimization driver
pub mod train;

// Re-export main types
pub use self::context::{Context, Flag};
pub use self::dataset::{Attribute, Dataset, Event, Obs, Sequence};
pub use self::dictionary::Dictionary;
pub use self::error::{Error, Result};
pub use self::evaluator::Evaluator;
pub use self::model::Model;
pub use self::params::{ParamTable, StateParam, BOUNDARY, BOUNDARY_LABEL, OUT_OF_ALPHABET};
pub use self::reader::{parse_token, read_labeled_file, read_train_file};
pub use self::tagger::{ConfidenceMode, Tagger, TestReport, OUT_OF_CLASS};

// Re-export training types for convenience
pub use self::train::{Regularizer, TrainOptions, Trainer};
