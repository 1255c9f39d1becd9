use lenet_mnist::config::{TrainingConfig, load_config};
use lenet_mnist::train::run;
use log::{error, info};
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // The only argument is an optional JSON file overriding the defaults.
    let config = match std::env::args().nth(1) {
        Some(path) => match load_config(&path) {
            Ok(config) => {
                info!("Loaded configuration from {path}");
                config
            }
            Err(err) => {
                error!("Could not load {path}: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => TrainingConfig::default(),
    };

    match run(&config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
