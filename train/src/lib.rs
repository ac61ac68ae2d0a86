//! The training and evaluation program of the landmark patch classifier.

pub mod common;
pub mod config;
pub mod eval;
pub mod input_stream;
pub mod logging;
pub mod train;
pub mod utils;

use crate::{common::*, config::Config, eval::EvalSummary, input_stream::InputStream};

/// Creates `<logging.dir>/<timestamp>` and saves the configuration there.
async fn prepare_logging_dir(config: &Config) -> Result<Arc<PathBuf>> {
    let start_time = Local::now();
    let logging_dir = Arc::new(
        config
            .logging
            .dir
            .join(format!("{}", start_time.format(utils::FILE_STRFTIME))),
    );

    tokio::fs::create_dir_all(&*logging_dir).await?;
    let path = logging_dir.join("config.json5");
    let text = serde_json::to_string_pretty(config)?;
    tokio::fs::write(&path, text).await?;

    Ok(logging_dir)
}

/// The entry of training program.
pub async fn start(config: Arc<Config>) -> Result<()> {
    let logging_dir = prepare_logging_dir(&config).await?;
    let checkpoint_dir = Arc::new(logging_dir.join("checkpoints"));
    tokio::fs::create_dir_all(&*checkpoint_dir).await?;
    info!("logging to '{}'", logging_dir.display());

    // create channels
    let (logging_tx, logging_rx) = broadcast::channel(16);

    // load dataset
    info!("loading dataset");
    let stream = InputStream::new(&config, true, Some(logging_tx.clone()))?;

    // start logger
    let logging_future =
        logging::logging_worker(config.clone(), logging_dir.clone(), logging_rx).await?;

    // training worker
    let training_worker_future = {
        let config = config.clone();
        let device = config.training.device;

        tokio::task::spawn_blocking(move || {
            // the input threads are joined when the receiver is dropped
            let data_rx = stream.start()?;
            train::training_worker(config, checkpoint_dir, data_rx, logging_tx, device)
        })
        .map(|result| Fallible::Ok(result??))
    };

    let (last_step, ()) = futures::try_join!(training_worker_future, logging_future)?;
    if let Some(step) = last_step {
        info!("stopped after step {}", step);
    }

    Ok(())
}

/// The entry of evaluation program.
pub async fn start_eval(config: Arc<Config>) -> Result<EvalSummary> {
    let logging_dir = prepare_logging_dir(&config).await?;
    info!("logging to '{}'", logging_dir.display());

    let (logging_tx, logging_rx) = broadcast::channel(16);
    let logging_future =
        logging::logging_worker(config.clone(), logging_dir.clone(), logging_rx).await?;

    let eval_future = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || eval::evaluate(&config, Some(logging_tx)))
            .map(|result| Fallible::Ok(result??))
    };

    let (summary, ()) = futures::try_join!(eval_future, logging_future)?;
    Ok(summary)
}
