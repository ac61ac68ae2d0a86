use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tracing::{info, trace_span, Instrument};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};
use train::config::Config;

#[derive(Debug, Clone, StructOpt)]
/// Train or evaluate the landmark patch classifier
struct Args {
    #[structopt(long, default_value = "train.json5")]
    /// configuration file
    pub config_file: PathBuf,
    #[structopt(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Clone, StructOpt)]
enum Command {
    /// Train the model on the training files
    Train,
    /// Evaluate a checkpoint on the evaluation files
    Eval,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse arguments
    let Args { config_file, cmd } = Args::from_args();
    let config = Arc::new(
        Config::open(&config_file)
            .with_context(|| format!("failed to load config file '{}'", config_file.display()))?,
    );

    match cmd {
        Command::Train => {
            train::start(config)
                .instrument(trace_span!("train"))
                .await?;
        }
        Command::Eval => {
            let summary = train::start_eval(config)
                .instrument(trace_span!("eval"))
                .await?;
            info!("{}", summary);
        }
    }

    Ok(())
}
