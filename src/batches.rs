use crate::error::{Error, Result};
use log::debug;
use ndarray::{Array2, ArrayView2, Axis};
use ndarray_rand::rand::{Rng, seq::SliceRandom};

/// A group of samples used for one gradient update. Row `i` of `labels` is the
/// one-hot class of row `i` of `images`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array2<f32>,
    pub labels: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An endless stream of shuffled batches over a fixed set of samples.
///
/// Each epoch is a fresh random permutation of every sample index, cut into
/// contiguous chunks of `batch_size`. The last chunk of an epoch holds
/// whatever is left over and may be shorter. Once an epoch is used up the next
/// call to `next` starts a new permutation, so the iterator never returns
/// `None`; callers decide how many batches to take.
pub struct Batches<'a, R> {
    images: ArrayView2<'a, f32>,
    labels: ArrayView2<'a, f32>,
    batch_size: usize,
    rng: R,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
}

impl<'a, R: Rng> Batches<'a, R> {
    pub fn new(
        images: ArrayView2<'a, f32>,
        labels: ArrayView2<'a, f32>,
        batch_size: usize,
        rng: R,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidBatching("batch size must be at least 1".into()));
        }
        if images.nrows() != labels.nrows() {
            return Err(Error::InvalidBatching(format!(
                "{} images but {} labels",
                images.nrows(),
                labels.nrows()
            )));
        }
        if images.nrows() == 0 {
            return Err(Error::InvalidBatching("no samples to batch".into()));
        }

        let samples = images.nrows();
        Ok(Batches {
            images,
            labels,
            batch_size,
            rng,
            order: (0..samples).collect(),
            // Start past the end so the first call draws a permutation.
            cursor: samples,
            epoch: 0,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches in one full epoch, counting the final partial batch.
    pub fn batches_per_epoch(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// How many permutations have been started so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Drop the rest of the current permutation. The next batch starts a new
    /// epoch.
    pub fn restart(&mut self) {
        self.cursor = self.order.len();
    }

    /// The batches left in the current epoch, or a whole new epoch if the
    /// current one is used up.
    pub fn next_epoch(&mut self) -> impl Iterator<Item = Batch> {
        let remaining = if self.cursor >= self.order.len() {
            self.batches_per_epoch()
        } else {
            (self.order.len() - self.cursor).div_ceil(self.batch_size)
        };
        self.by_ref().take(remaining)
    }
}

impl<R: Rng> Iterator for Batches<'_, R> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
            self.epoch += 1;
            debug!("Starting batch epoch {}", self.epoch);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let rows = &self.order[self.cursor..end];
        let batch = Batch {
            images: self.images.select(Axis(0), rows),
            labels: self.labels.select(Axis(0), rows),
        };
        self.cursor = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (usize::MAX, None)
    }
}
