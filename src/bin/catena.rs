use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::Result;
use catena::{
    asset::NetworkAssets,
    cmd_utils::{ctrlc_handler, log_startup_err, Validator as validator},
    directive::{self, Directive},
    engine::{Engine, EngineOpt},
    event::NormalizedEvent,
    rule, tracer,
};
use clap::{Args, Parser, Subcommand};
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    sync::{broadcast, Semaphore},
    time::sleep,
};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(
    version,
    about = "Catena correlation server",
    long_about = "Catena correlation server\n\n\
    Catena correlates normalized security events against multi-stage\n\
    directives, tracking attack progress through live backlogs and\n\
    projecting alarms as risk becomes meaningful."
)]
struct Cli {
    #[command(subcommand)]
    subcommand: SubCommands,
    /// Increase logging verbosity
    #[arg(short('v'), long, action = clap::ArgAction::Count)]
    verbosity: u8,
    /// Enable debug output, for compatibility purpose
    #[arg(long = "debug", env = "CATENA_DEBUG", value_name = "boolean", default_value_t = false)]
    debug: bool,
    /// Enable trace output, for compatibility purpose
    #[arg(long = "trace", env = "CATENA_TRACE", value_name = "boolean", default_value_t = false)]
    trace: bool,
    /// Enable json-lines log output
    #[arg(
        short('j'),
        long = "json",
        env = "CATENA_JSON",
        value_name = "boolean",
        default_value_t = false
    )]
    use_json: bool,
    /// Testing environment flag
    #[arg(long = "test-env", value_name = "boolean", default_value_t = false)]
    test_env: bool,
}

#[derive(Subcommand)]
enum SubCommands {
    #[command(
        about = "Start the correlation server",
        long_about = "Start the correlation server, reading normalized events as JSON lines from stdin",
        name = "serve"
    )]
    ServeCommand(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Seconds between expiration scans of live backlogs
    #[arg(
        short('r'),
        long = "reap-interval",
        env = "CATENA_REAPINTERVAL",
        value_name = "seconds",
        default_value_t = 10
    )]
    reap_interval: u64,
    /// Max. concurrent event dispatches
    #[arg(
        short('w'),
        long = "workers",
        env = "CATENA_WORKERS",
        value_name = "number",
        default_value_t = 4
    )]
    workers: usize,
}

fn main() -> ExitCode {
    match run(Cli::parse()).is_ok() {
        true => ExitCode::SUCCESS,
        false => ExitCode::FAILURE,
    }
}

fn run(args: Cli) -> Result<()> {
    let test_env = args.test_env;
    let SubCommands::ServeCommand(sargs) = args.subcommand;

    let reap_interval = validator::reap_interval(sargs.reap_interval)
        .map_err(|e| log_startup_err("reading reap_interval", e))?;
    let workers =
        validator::workers(sargs.workers).map_err(|e| log_startup_err("reading workers", e))?;
    let log_verbosity = validator::log_verbosity(args.trace, args.debug, args.verbosity);
    let log_format = validator::log_format(args.use_json);

    let subscriber = tracer::setup(log_verbosity, log_format)?;
    tracing::subscriber::set_global_default(subscriber)?;

    let assets = Arc::new(
        NetworkAssets::new(test_env, Some(vec!["assets".to_string()]))
            .map_err(|e| log_startup_err("loading assets", e))?,
    );
    let directives = directive::load_directives(test_env, Some(vec!["directives".to_string()]))
        .map_err(|e| log_startup_err("loading directives", e))?;

    let (cancel_tx, _) = broadcast::channel::<()>(1);
    ctrlc_handler(cancel_tx.clone(), !test_env)
        .map_err(|e| log_startup_err("setting up ctrl-c handler", e))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| log_startup_err("building tokio runtime", e.into()))?;

    rt.block_on(serve(test_env, assets, directives, cancel_tx, reap_interval, workers))
}

async fn serve(
    test_env: bool,
    assets: Arc<NetworkAssets>,
    directives: Vec<Directive>,
    cancel_tx: broadcast::Sender<()>,
    reap_interval: u64,
    workers: usize,
) -> Result<()> {
    let engine = Arc::new(Engine::new(EngineOpt {
        test_env,
        assets,
        cancel_tx: cancel_tx.clone(),
        reap_interval: Duration::from_secs(reap_interval),
        id_seed: None,
    })?);
    engine.start()?;

    // candidate narrowing the same way an upstream matcher would: only
    // directives with at least one rule keyed on the event's attributes are
    // dispatched
    let targets: Arc<Vec<FilterTarget>> =
        Arc::new(directives.into_iter().map(FilterTarget::new).collect());

    info!("server started with {} directives, {} dispatch workers", targets.len(), workers);

    let semaphore = Arc::new(Semaphore::new(workers));
    let mut cancel_rx = cancel_tx.subscribe();
    let mut lines = BufReader::new(stdin()).lines();
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                info!("cancel signal received, exiting server");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(v)) => v,
                    Ok(None) => {
                        info!("event stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!("cannot read event stream: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let event: NormalizedEvent = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("cannot parse event, skipping it: {}", e);
                        continue;
                    }
                };
                if !event.valid() {
                    warn!(event.id, event.conn_id, "invalid event, skipping it");
                    continue;
                }
                let permit = semaphore.clone().acquire_owned().await?;
                let engine = engine.clone();
                let targets = targets.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    dispatch_candidates(&engine, &targets, &event);
                });
            }
        }
    }

    _ = cancel_tx.send(());
    // give the reaper and removal consumer time to wind down
    sleep(Duration::from_millis(500)).await;
    Ok(())
}

struct FilterTarget {
    directive: Directive,
    sid_pairs: Vec<rule::SIDPair>,
    taxo_pairs: Vec<rule::TaxoPair>,
}

impl FilterTarget {
    fn new(directive: Directive) -> Self {
        let (mut sid_pairs, mut taxo_pairs) = rule::get_quick_check_pairs(&directive.rules);
        sid_pairs.shrink_to_fit();
        taxo_pairs.shrink_to_fit();
        FilterTarget { directive, sid_pairs, taxo_pairs }
    }

    fn quick_match(&self, event: &NormalizedEvent) -> bool {
        rule::quick_check_plugin_rule(&self.sid_pairs, event)
            || rule::quick_check_taxo_rule(&self.taxo_pairs, event)
    }
}

fn dispatch_candidates(engine: &Engine, targets: &[FilterTarget], event: &NormalizedEvent) {
    let candidates: Vec<&FilterTarget> =
        targets.iter().filter(|t| t.quick_match(event)).collect();
    debug!(event.id, "event matched rules in {} directive(s)", candidates.len());
    for t in candidates {
        if let Err(e) = engine.process(event, &t.directive) {
            warn!(
                directive.id = t.directive.id,
                event.id, "error processing event: {}", e
            );
        }
    }
}
