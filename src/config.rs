//! Hyperparameters for a training run.
//!
//! The defaults are the constants the program was designed around. A JSON
//! file may override any subset of them:
//!
//! ```json
//! {
//!   "learning_rate": 0.001,
//!   "epochs": 3,
//!   "optimizer": "sgd"
//! }
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::{fs, path::Path};

pub const LEARNING_RATE: f32 = 0.01;
pub const BATCH_SIZE: usize = 256;
pub const EPOCHS: usize = 10;
pub const VALIDATION_FRACTION: f64 = 0.1;
pub const INPUT_SIZE: usize = 28 * 28;
pub const NUM_CLASSES: usize = 10;
pub const SEED: u64 = 0;
pub const EVAL_CHUNK_SIZE: usize = 10_000;
pub const DATA_DIR: &str = "data/mnist";
// CVDF mirror of http://yann.lecun.com/exdb/mnist/
pub const BASE_URL: &str = "https://storage.googleapis.com/cvdf-datasets/mnist/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    /// Step size handed to the optimizer.
    pub learning_rate: f32,
    /// Rows per gradient update. The last batch of an epoch may be smaller.
    pub batch_size: usize,
    /// Full passes over the training split.
    pub epochs: usize,
    /// Share of the source training set held out for validation, in `[0, 1)`.
    pub validation_fraction: f64,
    /// Pixels per flattened image.
    pub input_size: usize,
    pub num_classes: usize,
    /// Seeds parameter initialization, the validation split and batch order.
    pub seed: u64,
    pub optimizer: OptimizerKind,
    /// Rows evaluated at once when measuring accuracy over a whole split.
    pub eval_chunk_size: usize,
    /// Where the downloaded archives are cached.
    pub data_dir: String,
    pub base_url: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            learning_rate: LEARNING_RATE,
            batch_size: BATCH_SIZE,
            epochs: EPOCHS,
            validation_fraction: VALIDATION_FRACTION,
            input_size: INPUT_SIZE,
            num_classes: NUM_CLASSES,
            seed: SEED,
            optimizer: OptimizerKind::Adam,
            eval_chunk_size: EVAL_CHUNK_SIZE,
            data_dir: DATA_DIR.to_string(),
            base_url: BASE_URL.to_string(),
        }
    }
}

impl TrainingConfig {
    /// Check every field against the range the training code relies on.
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.epochs == 0 {
            return Err(Error::Config("epochs must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(Error::Config(format!(
                "validation_fraction must lie in [0, 1), got {}",
                self.validation_fraction
            )));
        }
        if self.input_size == 0 {
            return Err(Error::Config("input_size must be at least 1".into()));
        }
        if self.num_classes < 2 {
            return Err(Error::Config("num_classes must be at least 2".into()));
        }
        if self.eval_chunk_size == 0 {
            return Err(Error::Config("eval_chunk_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Read a JSON file, fill missing fields from the defaults and validate.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)?;
    let config: TrainingConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
