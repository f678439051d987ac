use anyhow::{anyhow, Error, Result};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::tracer;

pub fn log_startup_err(context: &str, err: Error) -> Error {
    _ = tracing_subscriber::fmt().try_init();
    error!("error {}: {:?}", context, err);
    err
}

pub fn ctrlc_handler(cancel_tx: broadcast::Sender<()>, report_err: bool) -> Result<()> {
    let res = ctrlc::set_handler(move || {
        info!("ctrl-c received, shutting down ...");
        let _ = cancel_tx.send(());
    });
    if let Err(e) = res {
        if report_err {
            return Err(e.into());
        }
    }
    Ok(())
}

pub struct Validator {}

impl Validator {
    pub fn log_verbosity(trace: bool, debug: bool, verbosity: u8) -> u8 {
        if debug {
            1
        } else if trace {
            2
        } else {
            verbosity
        }
    }

    pub fn log_format(use_json: bool) -> tracer::LogType {
        if use_json {
            tracer::LogType::Json
        } else {
            tracer::LogType::Plain
        }
    }

    pub fn reap_interval(seconds: u64) -> Result<u64> {
        if seconds == 0 {
            return Err(anyhow!("reap interval cannot be zero"));
        }
        Ok(seconds)
    }

    pub fn workers(n: usize) -> Result<usize> {
        if n == 0 {
            return Err(anyhow!("worker count cannot be zero"));
        }
        Ok(n)
    }
}
