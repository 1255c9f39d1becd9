use crate::batches::Batch;
use crate::mnist::Samples;
use itertools::Itertools;
use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_rand::{
    RandomExt,
    rand::Rng,
    rand_distr::{Distribution, StandardNormal},
};

pub const HIDDEN_SIZES: [usize; 2] = [300, 100];

/// One affine layer: `output = input . weight + bias`, with `weight` shaped
/// `[fan_in, fan_out]` so a batch of row vectors can be multiplied directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Every trainable array of the network, keyed by layer name and kept in
/// forward order. Gradients, optimizer moments and updates use the same type,
/// so they always mirror the layout of the parameters they belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    layers: Vec<(String, Linear)>,
}

/// Name of the `index`-th layer: `linear`, `linear_1`, `linear_2`, ...
pub fn layer_name(index: usize) -> String {
    if index == 0 {
        "linear".to_string()
    } else {
        format!("linear_{index}")
    }
}

// A standard normal sample redrawn until it falls within two standard
// deviations of the mean.
struct TruncatedStandardNormal;

impl Distribution<f32> for TruncatedStandardNormal {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        loop {
            let z: f32 = StandardNormal.sample(rng);
            if z.abs() <= 2.0 {
                return z;
            }
        }
    }
}

impl Params {
    /// Build one layer per consecutive pair in `sizes`. Weights come from a
    /// truncated normal distribution with standard deviation `1 / sqrt(fan_in)`
    /// and biases start at zero.
    pub fn init<R: Rng + ?Sized>(sizes: &[usize], rng: &mut R) -> Params {
        assert!(sizes.len() >= 2, "a network needs an input and an output size");

        let layers = sizes
            .iter()
            .tuple_windows()
            .enumerate()
            .map(|(index, (&fan_in, &fan_out))| {
                let scale = 1.0 / (fan_in as f32).sqrt();
                let weight =
                    Array::random_using((fan_in, fan_out), TruncatedStandardNormal, &mut *rng) * scale;
                let layer = Linear {
                    weight,
                    bias: Array1::zeros(fan_out),
                };
                (layer_name(index), layer)
            })
            .collect();

        Params { layers }
    }

    /// LeNet-300-100: two hidden layers of 300 and 100 units.
    pub fn lenet_300_100<R: Rng + ?Sized>(
        input_size: usize,
        num_classes: usize,
        rng: &mut R,
    ) -> Params {
        let [first, second] = HIDDEN_SIZES;
        Params::init(&[input_size, first, second, num_classes], rng)
    }

    pub fn from_layers(layers: Vec<(String, Linear)>) -> Params {
        assert!(!layers.is_empty(), "a network needs at least one layer");
        Params { layers }
    }

    pub fn get(&self, name: &str) -> Option<&Linear> {
        self.layers
            .iter()
            .find(|(layer_name, _)| layer_name == name)
            .map(|(_, layer)| layer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Linear)> {
        self.layers
            .iter()
            .map(|(name, layer)| (name.as_str(), layer))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Widths of the input and of every layer output.
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.layers[0].1.weight.nrows()];
        sizes.extend(self.layers.iter().map(|(_, layer)| layer.weight.ncols()));
        sizes
    }

    /// Total number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .map(|(_, layer)| layer.weight.len() + layer.bias.len())
            .sum()
    }

    /// True when both mappings have the same names in the same order with
    /// arrays of the same shapes.
    pub fn same_layout(&self, other: &Params) -> bool {
        self.layers.len() == other.layers.len()
            && self.layers.iter().zip(&other.layers).all(|(a, b)| {
                a.0 == b.0
                    && a.1.weight.dim() == b.1.weight.dim()
                    && a.1.bias.dim() == b.1.bias.dim()
            })
    }

    /// Same layout, every entry zero.
    pub fn zeros_like(&self) -> Params {
        self.map(|_| 0.0)
    }

    /// Apply `f` to every scalar.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Params {
        let layers = self
            .layers
            .iter()
            .map(|(name, layer)| {
                let layer = Linear {
                    weight: layer.weight.mapv(&f),
                    bias: layer.bias.mapv(&f),
                };
                (name.clone(), layer)
            })
            .collect();
        Params { layers }
    }

    /// Combine two mappings of the same layout entry by entry.
    ///
    /// # Panics
    ///
    /// Panics if the layouts differ.
    pub fn zip_map(&self, other: &Params, f: impl Fn(f32, f32) -> f32) -> Params {
        assert!(
            self.same_layout(other),
            "parameter layouts must match: {:?} vs {:?}",
            self.sizes(),
            other.sizes()
        );
        let layers = self
            .layers
            .iter()
            .zip(&other.layers)
            .map(|((name, a), (_, b))| {
                let layer = Linear {
                    weight: Zip::from(&a.weight)
                        .and(&b.weight)
                        .map_collect(|&x, &y| f(x, y)),
                    bias: Zip::from(&a.bias).and(&b.bias).map_collect(|&x, &y| f(x, y)),
                };
                (name.clone(), layer)
            })
            .collect();
        Params { layers }
    }

    /// Class log-probabilities for a batch of flattened images, one row per
    /// image. Every layer but the last is followed by a rectifier; the last is
    /// normalized with a log-softmax over the class axis.
    pub fn forward(&self, images: ArrayView2<f32>) -> Array2<f32> {
        let (last, hidden) = self
            .layers
            .split_last()
            .expect("parameters always hold at least one layer");

        let mut activation = images.to_owned();
        for (_, layer) in hidden {
            activation = affine(activation.view(), layer).mapv_into(relu);
        }
        log_softmax(affine(activation.view(), &last.1))
    }

    /// Cross-entropy of `batch` together with its gradient with respect to
    /// every parameter.
    pub fn loss_and_grad(&self, batch: &Batch) -> (f32, Params) {
        let rows = batch.len() as f32;
        let depth = self.layers.len();

        // Forward pass, remembering each layer's input and pre-activation.
        let mut inputs = Vec::with_capacity(depth);
        let mut pre_activations = Vec::with_capacity(depth);
        let mut activation = batch.images.clone();
        for (index, (_, layer)) in self.layers.iter().enumerate() {
            let z = affine(activation.view(), layer);
            inputs.push(activation);
            activation = if index + 1 < depth {
                z.mapv(relu)
            } else {
                log_softmax(z.clone())
            };
            pre_activations.push(z);
        }
        let log_probs = activation;
        let loss = -(&log_probs * &batch.labels).sum() / rows;

        // Backward pass. `delta` always holds d(loss)/dz for the layer being
        // visited, one row per sample, where z is that layer's pre-activation.
        //
        // The loss is -sum(y * log_softmax(z)) / B. Differentiating through
        // log-softmax gives softmax(z) * sum(y) - y for each row, and the
        // softmax is just exp(log_probs), which the forward pass already
        // produced. The row mass sum(y) is 1 for one-hot targets but is kept
        // general so soft targets still get the right gradient.
        let row_mass = batch.labels.sum_axis(Axis(1)).insert_axis(Axis(1));
        let mut delta = (log_probs.mapv(f32::exp) * &row_mass - &batch.labels) / rows;

        // Walk the layers from the output back to the input. For z = x W + b,
        // dL/dW = x^T delta, so the batch sum happens inside the product, and
        // dL/db is delta summed over the batch. The error then moves one
        // layer down through W^T, giving d(loss)/d(activation) of the layer
        // below. That still has to pass through the ReLU to become the lower
        // layer's delta.
        let mut grads = Vec::with_capacity(depth);
        for index in (0..depth).rev() {
            let (name, layer) = &self.layers[index];
            let grad = Linear {
                weight: inputs[index].t().dot(&delta),
                bias: delta.sum_axis(Axis(0)),
            };

            // The first layer's input is the image itself, so nothing below it
            // needs an error signal.
            if index > 0 {
                let mut upstream = delta.dot(&layer.weight.t());
                // relu'(z) is 1 for z > 0 and 0 otherwise, including z == 0,
                // so the gate just zeroes entries whose pre-activation was not
                // positive. `pre_activations[index - 1]` is the z that fed
                // this layer's input.
                Zip::from(&mut upstream)
                    .and(&pre_activations[index - 1])
                    .for_each(|d, &z| {
                        if z <= 0.0 {
                            *d = 0.0;
                        }
                    });
                delta = upstream;
            }
            grads.push((name.clone(), grad));
        }
        // Gradients were collected output-first. Flip them to match the
        // parameter order.
        grads.reverse();

        (loss, Params { layers: grads })
    }
}

fn affine(input: ArrayView2<f32>, layer: &Linear) -> Array2<f32> {
    input.dot(&layer.weight) + &layer.bias
}

fn relu(z: f32) -> f32 {
    z.max(0.0)
}

// Shift each row by its maximum before exponentiating so large logits cannot
// overflow.
fn log_softmax(mut logits: Array2<f32>) -> Array2<f32> {
    for mut row in logits.outer_iter_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &z| acc.max(z));
        let log_sum = row.fold(0.0, |acc, &z| acc + (z - max).exp()).ln() + max;
        row -= log_sum;
    }
    logits
}

// Ties go to the lowest index. `position_max_by` keeps the last maximum, so
// search the row backwards and flip the index.
fn argmax(row: ArrayView1<f32>) -> Option<usize> {
    row.iter()
        .rev()
        .position_max_by(|a, b| a.total_cmp(b))
        .map(|reversed| row.len() - 1 - reversed)
}

/// Negative mean over rows of `sum(log_probs * labels)`.
pub fn cross_entropy(params: &Params, images: ArrayView2<f32>, labels: ArrayView2<f32>) -> f32 {
    let log_probs = params.forward(images);
    -(&log_probs * &labels).sum() / labels.nrows() as f32
}

/// Number of rows whose most likely class is the labelled class.
pub fn correct_count(params: &Params, images: ArrayView2<f32>, labels: ArrayView2<f32>) -> usize {
    let log_probs = params.forward(images);
    log_probs
        .outer_iter()
        .zip(labels.outer_iter())
        .filter(|(predicted, target)| argmax(predicted.view()) == argmax(target.view()))
        .count()
}

/// Fraction of rows classified correctly. `images` must hold at least one row.
pub fn accuracy(params: &Params, images: ArrayView2<f32>, labels: ArrayView2<f32>) -> f32 {
    correct_count(params, images, labels) as f32 / images.nrows() as f32
}

/// Accuracy over a whole split, computed `chunk_size` rows at a time.
pub fn evaluate(params: &Params, samples: &Samples, chunk_size: usize) -> f32 {
    let correct: usize = samples
        .images
        .axis_chunks_iter(Axis(0), chunk_size)
        .zip(samples.labels.axis_chunks_iter(Axis(0), chunk_size))
        .map(|(images, labels)| correct_count(params, images, labels))
        .sum();
    correct as f32 / samples.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_rand::rand::{SeedableRng, rngs::StdRng};

    // A small network with fixed weights: small enough that every hidden
    // pre-activation stays well above zero for inputs in [0, 0.2].
    fn fixed_params() -> Params {
        let sizes = [4, 5, 6, 3];
        let layers = sizes
            .iter()
            .tuple_windows()
            .enumerate()
            .map(|(index, (&fan_in, &fan_out))| {
                let weight = Array2::from_shape_fn((fan_in, fan_out), |(i, j)| {
                    0.1 * ((i * 7 + j * 3 + index) as f32).sin()
                });
                let bias_value = if index + 2 < sizes.len() { 0.5 } else { 0.0 };
                let layer = Linear {
                    weight,
                    bias: Array1::from_elem(fan_out, bias_value),
                };
                (layer_name(index), layer)
            })
            .collect();
        Params::from_layers(layers)
    }

    fn fixed_batch() -> Batch {
        Batch {
            images: Array2::from_shape_fn((3, 4), |(r, c)| 0.05 * ((r * 4 + c) % 5) as f32),
            labels: array![[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]],
        }
    }

    #[test]
    fn lenet_layout() {
        let mut rng = StdRng::seed_from_u64(0);
        let params = Params::lenet_300_100(784, 10, &mut rng);

        assert_eq!(params.sizes(), vec![784, 300, 100, 10]);
        assert_eq!(params.num_parameters(), 784 * 300 + 300 + 300 * 100 + 100 + 100 * 10 + 10);
        let names: Vec<&str> = params.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["linear", "linear_1", "linear_2"]);
        assert_eq!(params.get("linear_1").unwrap().weight.dim(), (300, 100));
        assert!(params.get("linear_3").is_none());
    }

    #[test]
    fn init_is_seeded_and_truncated() {
        let a = Params::init(&[50, 20, 10], &mut StdRng::seed_from_u64(4));
        let b = Params::init(&[50, 20, 10], &mut StdRng::seed_from_u64(4));
        let c = Params::init(&[50, 20, 10], &mut StdRng::seed_from_u64(5));
        assert_eq!(a, b);
        assert_ne!(a, c);

        for (_, layer) in a.iter() {
            let bound = 2.0 / (layer.weight.nrows() as f32).sqrt();
            assert!(layer.weight.iter().all(|w| w.abs() <= bound + 1e-6));
            assert!(layer.bias.iter().all(|&b| b == 0.0));
        }
    }

    #[test]
    fn forward_yields_normalized_log_probabilities() {
        let mut rng = StdRng::seed_from_u64(1);
        let params = Params::init(&[8, 16, 4], &mut rng);
        let images = Array2::from_shape_fn((5, 8), |(r, c)| (r + c) as f32 / 13.0);

        let log_probs = params.forward(images.view());
        assert_eq!(log_probs.dim(), (5, 4));
        for row in log_probs.outer_iter() {
            assert!(row.iter().all(|&p| p <= 0.0));
            assert_abs_diff_eq!(row.mapv(f32::exp).sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn log_softmax_handles_large_logits() {
        let log_probs = log_softmax(array![[1000.0, 0.0], [-1000.0, -1000.0]]);
        assert!(log_probs.iter().all(|p| p.is_finite()));
        assert_abs_diff_eq!(log_probs[[0, 0]], 0.0);
        assert_abs_diff_eq!(log_probs[[1, 1]], -(2.0f32.ln()), epsilon = 1e-4);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let params = fixed_params();
        let batch = fixed_batch();
        let (loss, grads) = params.loss_and_grad(&batch);
        assert_abs_diff_eq!(
            loss,
            cross_entropy(&params, batch.images.view(), batch.labels.view()),
            epsilon = 1e-6
        );

        let loss_at = |params: &Params| {
            cross_entropy(params, batch.images.view(), batch.labels.view())
        };
        let eps = 1e-2;
        for layer_index in 0..params.len() {
            let (name, layer) = &params.layers[layer_index];
            let grad = grads.get(name).unwrap();

            for ((i, j), &analytic) in grad.weight.indexed_iter() {
                let mut plus = params.clone();
                plus.layers[layer_index].1.weight[[i, j]] += eps;
                let mut minus = params.clone();
                minus.layers[layer_index].1.weight[[i, j]] -= eps;
                let numeric = (loss_at(&plus) - loss_at(&minus)) / (2.0 * eps);
                assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-3);
            }
            for (k, &analytic) in grad.bias.indexed_iter() {
                let mut plus = params.clone();
                plus.layers[layer_index].1.bias[k] += eps;
                let mut minus = params.clone();
                minus.layers[layer_index].1.bias[k] -= eps;
                let numeric = (loss_at(&plus) - loss_at(&minus)) / (2.0 * eps);
                assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-3);
            }
            assert_eq!(grad.weight.dim(), layer.weight.dim());
        }
    }

    #[test]
    fn dead_units_receive_no_gradient() {
        let mut params = fixed_params();
        params.layers[0].1.bias[2] = -10.0;
        let (_, grads) = params.loss_and_grad(&fixed_batch());

        let first = grads.get("linear").unwrap();
        assert!(first.weight.column(2).iter().all(|&g| g == 0.0));
        assert_eq!(first.bias[2], 0.0);
        let second = grads.get("linear_1").unwrap();
        assert!(second.weight.row(2).iter().all(|&g| g == 0.0));
    }

    #[test]
    fn cross_entropy_is_non_negative() {
        let mut rng = StdRng::seed_from_u64(2);
        for seed in 0..5 {
            let params = Params::init(&[6, 7, 5], &mut StdRng::seed_from_u64(seed));
            let images: Array2<f32> = Array::random_using((9, 6), StandardNormal, &mut rng);
            let labels = Array2::from_shape_fn((9, 5), |(r, c)| if r % 5 == c { 1.0 } else { 0.0 });
            assert!(cross_entropy(&params, images.view(), labels.view()) >= 0.0);
        }
    }

    #[test]
    fn accuracy_counts_matching_argmax_and_is_idempotent() {
        // The output layer copies its input, so the prediction is the argmax
        // of the image itself.
        let identity = Linear {
            weight: Array2::eye(3),
            bias: Array1::zeros(3),
        };
        let params = Params::from_layers(vec![(layer_name(0), identity)]);
        let images = array![[0.9, 0.1, 0.0], [0.0, 0.2, 0.7], [0.3, 0.6, 0.1], [0.5, 0.4, 0.1]];
        let labels = array![[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [1.0, 0.0, 0.0]];

        assert_eq!(correct_count(&params, images.view(), labels.view()), 3);
        let first = accuracy(&params, images.view(), labels.view());
        let second = accuracy(&params, images.view(), labels.view());
        assert_eq!(first, 0.75);
        assert_eq!(first, second);

        let samples = Samples::new(images, labels).unwrap();
        for chunk_size in [1, 3, 4, 100] {
            assert_eq!(evaluate(&params, &samples, chunk_size), 0.75);
        }
    }

    #[test]
    fn ties_predict_the_lowest_class() {
        assert_eq!(argmax(array![0.0, 0.0, 0.0].view()), Some(0));
        assert_eq!(argmax(array![0.1, 0.7, 0.7, 0.2].view()), Some(1));
        assert_eq!(argmax(ArrayView1::from(&[] as &[f32])), None);

        // A zero layer outputs equal logits for every image.
        let dead = Linear {
            weight: Array2::zeros((2, 3)),
            bias: Array1::zeros(3),
        };
        let params = Params::from_layers(vec![(layer_name(0), dead)]);
        let images = array![[0.0, 0.0], [0.4, 0.9]];
        let labels = array![[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        assert_eq!(correct_count(&params, images.view(), labels.view()), 1);
    }

    #[test]
    fn zip_map_combines_entrywise() {
        let params = fixed_params();
        let doubled = params.zip_map(&params, |a, b| a + b);
        assert_eq!(doubled, params.map(|x| 2.0 * x));
        assert!(params.zeros_like().iter().all(|(_, layer)| layer.weight.sum() == 0.0));
    }

    #[test]
    #[should_panic(expected = "parameter layouts must match")]
    fn zip_map_rejects_mismatched_layouts() {
        let mut rng = StdRng::seed_from_u64(0);
        let a = Params::init(&[3, 4, 2], &mut rng);
        let b = Params::init(&[3, 5, 2], &mut rng);
        a.zip_map(&b, |x, _| x);
    }
}
