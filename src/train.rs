use crate::batches::Batches;
use crate::config::{OptimizerKind, TrainingConfig};
use crate::error::{Error, Result};
use crate::mnist::{MnistData, Samples};
use crate::network::{Params, evaluate};
use crate::optim::{Adam, GradientTransformation, Sgd, apply_updates};
use crate::rng::{self, Stream};
use log::{debug, info};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    /// Counted from 1.
    pub epoch: usize,
    /// Time spent on gradient steps, excluding evaluation.
    pub elapsed: Duration,
    pub mean_loss: f32,
    pub train_accuracy: f32,
    /// `None` when the validation split is empty.
    pub validation_accuracy: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub epochs: Vec<EpochReport>,
    pub test_accuracy: f32,
    pub params: Params,
}

impl TrainingReport {
    pub fn final_train_accuracy(&self) -> Option<f32> {
        self.epochs.last().map(|epoch| epoch.train_accuracy)
    }
}

/// Load MNIST as described by `config` and train on it.
pub fn run(config: &TrainingConfig) -> Result<TrainingReport> {
    config.validate()?;
    let data = MnistData::load(config, &mut rng::seeded(config.seed, Stream::Split))?;
    train(config, &data)
}

/// Train a freshly initialized LeNet-300-100 on `data.train`, reporting
/// accuracy after every epoch, then measure it once on `data.test`.
pub fn train(config: &TrainingConfig, data: &MnistData) -> Result<TrainingReport> {
    config.validate()?;
    check_split("training", &data.train, config)?;
    check_split("test", &data.test, config)?;
    if !data.validation.is_empty() {
        check_split("validation", &data.validation, config)?;
    }

    let params = Params::lenet_300_100(
        config.input_size,
        config.num_classes,
        &mut rng::seeded(config.seed, Stream::Init),
    );

    match config.optimizer {
        OptimizerKind::Adam => fit(Adam::new(config.learning_rate), params, config, data),
        OptimizerKind::Sgd => fit(Sgd::new(config.learning_rate), params, config, data),
    }
}

fn check_split(name: &'static str, samples: &Samples, config: &TrainingConfig) -> Result<()> {
    if samples.is_empty() {
        return Err(Error::EmptySplit(name));
    }
    if samples.images.ncols() != config.input_size {
        return Err(Error::ImageSize {
            expected: config.input_size,
            found: samples.images.ncols(),
        });
    }
    if samples.labels.ncols() != config.num_classes {
        return Err(Error::Config(format!(
            "the {name} labels have {} classes, expected {}",
            samples.labels.ncols(),
            config.num_classes
        )));
    }
    Ok(())
}

/// Run the training loop from the given starting parameters with any
/// optimizer.
pub fn fit<O: GradientTransformation>(
    optimizer: O,
    params: Params,
    config: &TrainingConfig,
    data: &MnistData,
) -> Result<TrainingReport> {
    let mut batches = Batches::new(
        data.train.images.view(),
        data.train.labels.view(),
        config.batch_size,
        rng::seeded(config.seed, Stream::Shuffle),
    )?;

    info!(
        "Training {} parameters for {} epochs of {} batches of up to {} samples",
        params.num_parameters(),
        config.epochs,
        batches.batches_per_epoch(),
        batches.batch_size()
    );

    let mut params = params;
    let mut state = optimizer.init(&params);
    let mut epochs = Vec::with_capacity(config.epochs);

    for epoch in 1..=config.epochs {
        let start = Instant::now();
        let mut total_loss = 0.0;
        let mut steps = 0;

        for batch in batches.next_epoch() {
            let (loss, grads) = params.loss_and_grad(&batch);
            let (updates, next_state) = optimizer.update(&grads, state, &params);
            state = next_state;
            params = apply_updates(params, &updates);

            total_loss += loss;
            steps += 1;
            debug!("Epoch {epoch} step {steps}: loss {loss:.4}");
        }
        let elapsed = start.elapsed();

        let train_accuracy = evaluate(&params, &data.train, config.eval_chunk_size);
        let validation_accuracy = (!data.validation.is_empty())
            .then(|| evaluate(&params, &data.validation, config.eval_chunk_size));

        println!("Epoch {epoch} in {:.2} sec", elapsed.as_secs_f64());
        println!("Training set accuracy {:.2}%", 100.0 * train_accuracy);
        if let Some(accuracy) = validation_accuracy {
            println!("Validation set accuracy {:.2}%", 100.0 * accuracy);
        }

        epochs.push(EpochReport {
            epoch,
            elapsed,
            mean_loss: total_loss / steps as f32,
            train_accuracy,
            validation_accuracy,
        });
    }

    info!("Training finished, evaluating on {} test samples", data.test.len());
    let test_accuracy = evaluate(&params, &data.test, config.eval_chunk_size);
    println!("Test set accuracy {:.2}%", 100.0 * test_accuracy);

    Ok(TrainingReport {
        epochs,
        test_accuracy,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mnist::one_hot;
    use ndarray::Array2;

    fn tiny_data(input_size: usize) -> MnistData {
        let labels: Vec<u8> = (0..40).map(|i| i % 2).collect();
        let images = Array2::from_shape_fn((40, input_size), |(r, c)| {
            if c % 2 == labels[r] as usize { 1.0 } else { 0.0 }
        });
        let samples = Samples::new(images, one_hot(&labels, 2).unwrap()).unwrap();
        MnistData {
            train: samples.clone(),
            validation: samples.select(&[]),
            test: samples,
        }
    }

    fn tiny_config() -> TrainingConfig {
        TrainingConfig {
            input_size: 6,
            num_classes: 2,
            epochs: 2,
            batch_size: 8,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn reports_every_epoch_and_skips_empty_validation() {
        let report = train(&tiny_config(), &tiny_data(6)).unwrap();

        assert_eq!(report.epochs.len(), 2);
        assert_eq!(report.epochs[0].epoch, 1);
        assert!(report.epochs.iter().all(|e| e.validation_accuracy.is_none()));
        assert!(report.epochs.iter().all(|e| e.mean_loss.is_finite()));
        assert_eq!(report.params.sizes(), vec![6, 300, 100, 2]);
    }

    #[test]
    fn same_seed_same_result() {
        let config = TrainingConfig {
            optimizer: OptimizerKind::Sgd,
            ..tiny_config()
        };
        let first = train(&config, &tiny_data(6)).unwrap();
        let second = train(&config, &tiny_data(6)).unwrap();
        assert_eq!(first.params, second.params);
        assert_eq!(first.test_accuracy, second.test_accuracy);
    }

    #[test]
    fn rejects_mismatched_data() {
        let result = train(&tiny_config(), &tiny_data(5));
        assert!(matches!(
            result,
            Err(Error::ImageSize {
                expected: 6,
                found: 5
            })
        ));

        let mut data = tiny_data(6);
        data.test = data.test.select(&[]);
        assert!(matches!(
            train(&tiny_config(), &data),
            Err(Error::EmptySplit("test"))
        ));
    }
}
