use clap::Parser;
use std::error::Error;

mod cli;
mod error;
mod models;
mod report;
mod services;

use cli::CommandArgs;
use report::CsvReport;
use services::{PlatformSampler, RunController, CHILD_ENV_VAR};

fn main() -> anyhow::Result<()> {
    // self-spawned child: exit before paying for logger and runtime setup
    if std::env::var_os(CHILD_ENV_VAR).is_some() {
        return Ok(());
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    run()
}

#[tokio::main]
async fn run() -> anyhow::Result<()> {
    let args = CommandArgs::parse();
    let config = args.run_config()?;

    #[cfg(target_os = "linux")]
    log::info!("CLK_TCK = {}", services::sampler::procfs::clock_ticks());

    // a broken report path must not cost a run
    let mut report = args
        .report
        .as_deref()
        .and_then(|path| CsvReport::open(path).map_err(|e| log_error(&e)).ok());

    let controller = RunController::new(config, PlatformSampler::new());
    let result = match controller.run().await {
        Ok(result) => result,
        Err(e) => {
            log_error(&e);
            std::process::exit(1);
        }
    };

    report::log_summary(&result);

    if let Some(report) = report.as_mut() {
        if let Err(e) = report.write_run(&result) {
            log_error(&e);
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    Ok(())
}

fn log_error(e: &dyn Error) {
    log::error!("{}", e);
    let mut source = e.source();
    while let Some(cause) = source {
        log::error!("   caused by: {}", cause);
        source = cause.source();
    }
}
