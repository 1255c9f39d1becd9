//! Train LeNet-300-100 on MNIST with `ndarray`.
//!
//! The pieces, leaves first:
//!
//! - [`mnist`] downloads, caches and decodes the IDX archives and splits off
//!   a validation set.
//! - [`batches`] turns a split into an endless stream of shuffled batches.
//! - [`network`] holds the parameters, the forward pass, backpropagation,
//!   the loss and the accuracy metric.
//! - [`optim`] turns gradients into parameter updates.
//! - [`train`] drives the whole run.

pub mod batches;
pub mod config;
pub mod error;
pub mod mnist;
pub mod network;
pub mod optim;
pub mod rng;
pub mod train;

pub use error::{Error, Result};
