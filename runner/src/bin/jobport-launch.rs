use clap::Parser;
use jobport::launchers::{
    run::{launch, LaunchArgs},
    NULL_DEVICE, SENTINEL,
};
use std::{fs::OpenOptions, process::exit, sync::Mutex};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    let args = LaunchArgs::parse();

    // diagnostics go to the log file only, stdout carries the launcher's report
    if !args.log_file.is_empty() && args.log_file != NULL_DEVICE {
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&args.log_file)
        {
            Ok(file) => tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
                )
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init(),
            Err(e) => eprintln!("jobport-launch: cannot open log file {}: {e}", args.log_file),
        }
    }

    match launch(&args) {
        Ok(exit_code) => {
            println!("{SENTINEL}");
            exit(exit_code)
        }
        Err(e) => {
            error!(error = ?e, "Launch failed");
            println!("jobport-launch: {e}");
            exit(e.exit_code())
        }
    }
}
