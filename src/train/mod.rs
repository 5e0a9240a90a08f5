//! Training module: objectives, the optimization driver and the trainer
//! front-end.
//!
//! Two objectives share one parameter table and one driver: penalized
//! maximum likelihood with forward-backward gradients, and the cheaper
//! pseudo-likelihood used as a warm-start.

mod lbfgs;
mod trainer;

pub use self::lbfgs::{Lbfgs, LbfgsParams};
pub use self::trainer::{Regularizer, TrainOptions, Trainer};
