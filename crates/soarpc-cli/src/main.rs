//! # soarpc CLI entry point
//!
//! Hosts the built-in demo service and makes one-shot RPC calls, mostly
//! for smoke-testing a broker deployment. Real services embed
//! `soarpc_server` directly; this binary shows the full serve surface
//! (settings file, forking, respawn, file watching).
//!
//! ## Usage
//!
//! ```bash
//! # Serve the demo service with four workers
//! soarpc serve --settings service.toml --fork 4
//!
//! # Disable crash respawn
//! soarpc serve --settings service.toml --fork 4 --no-respawn
//!
//! # Watch source paths and reload on change
//! soarpc serve --settings service.toml --use-file-watcher src,demo
//!
//! # Call an action (raw JSON on stdout, jq-friendly)
//! soarpc call --settings service.toml example square '{"number": 7}'
//! ```

use anyhow::{Context as _, Result};
use argh::FromArgs;
use soarpc_client::{CallOptions, Client, ClientConfig};
use soarpc_common::serializer::{JsonSerializer, Serializer};
use soarpc_common::{vmap, Error, Value};
use soarpc_server::{
    forked_process_id, run_supervisor, settings_path_from_env, ActionError,
    ActionRegistration, FileWatcherSettings, ServerBuilder, ServerSettings,
    SupervisorOptions,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// soarpc - job/action RPC over a message broker
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

/// serve the built-in demo service
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
struct ServeArgs {
    /// path to the settings file (TOML/JSON/YAML); defaults to the
    /// SOARPC_SETTINGS environment variable
    #[argh(option, short = 's')]
    settings: Option<String>,

    /// name of the service to serve
    #[argh(option, default = "\"example\".into()")]
    service: String,

    /// number of worker processes (default 1: no forking)
    #[argh(option, short = 'f', default = "1")]
    fork: u32,

    /// do not respawn crashed workers
    #[argh(switch)]
    no_respawn: bool,

    /// comma-separated paths to watch for changes; any change triggers a
    /// graceful reload
    #[argh(option)]
    use_file_watcher: Option<String>,
}

/// call an action and print the raw JSON response body
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
struct CallArgs {
    /// path to the settings file; defaults to the SOARPC_SETTINGS
    /// environment variable
    #[argh(option, short = 's')]
    settings: Option<String>,

    /// name of the service to call
    #[argh(positional)]
    service: String,

    /// name of the action to call
    #[argh(positional)]
    action: String,

    /// JSON request body (defaults to an empty object)
    #[argh(positional, default = "\"{}\".into()")]
    body: String,

    /// seconds to wait for the response
    #[argh(option, short = 't')]
    timeout: Option<u64>,
}

fn settings_path(argument: Option<String>) -> Result<PathBuf> {
    argument
        .map(PathBuf::from)
        .or_else(settings_path_from_env)
        .context("no settings file: pass --settings or set SOARPC_SETTINGS")
}

/// The demo service: `echo` returns its body, `square` squares a
/// non-negative number, `slow` sleeps before responding.
fn demo_server_builder(
    service_name: &str,
    settings: ServerSettings,
    forked_process_id: Option<u32>,
) -> ServerBuilder {
    ServerBuilder::new(service_name, settings)
        .forked_process_id(forked_process_id)
        .action(
            "echo",
            ActionRegistration::new(|request| Ok(request.body.clone()))
                .with_description("Returns the request body unchanged."),
        )
        .action(
            "square",
            ActionRegistration::new(|request| {
                let number =
                    request.body.get("number").and_then(Value::as_i64).ok_or_else(|| {
                        ActionError::single(
                            Error::new("INVALID", "number is required")
                                .with_field("number")
                                .caller_error(),
                        )
                    })?;
                if number < 0 {
                    return Err(ActionError::single(
                        Error::new("INVALID", "number must not be negative")
                            .with_field("number")
                            .caller_error(),
                    ));
                }
                Ok(vmap! { "square" => number * number })
            })
            .with_description("Squares a non-negative integer."),
        )
        .action(
            "slow",
            ActionRegistration::new(|request| {
                let seconds =
                    request.body.get("seconds").and_then(Value::as_u64).unwrap_or(3);
                std::thread::sleep(Duration::from_secs(seconds));
                Ok(vmap! { "slept" => seconds as i64 })
            })
            .with_description("Sleeps before responding, for timeout testing."),
        )
}

fn run_serve(args: ServeArgs) -> Result<i32> {
    let path = settings_path(args.settings)?;
    let mut settings = ServerSettings::load(&path)?;

    if let Some(paths) = &args.use_file_watcher {
        let paths: Vec<PathBuf> =
            paths.split(',').map(str::trim).map(PathBuf::from).collect();
        settings.file_watcher = Some(match settings.file_watcher.take() {
            Some(watcher) => FileWatcherSettings { paths, ..watcher },
            None => FileWatcherSettings { paths, debounce_ms: 300 },
        });
    }

    let fork_id = forked_process_id();
    if fork_id.is_none() && args.fork > 1 {
        tracing::info!(forks = args.fork, "starting supervisor");
        let options = SupervisorOptions {
            fork_count: args.fork,
            respawn: !args.no_respawn,
            shutdown_grace: Duration::from_secs(settings.harakiri.shutdown_grace),
        };
        return Ok(run_supervisor(options, || {
            tracing::info!("pre-fork complete, spawning workers");
        }));
    }

    let server = demo_server_builder(&args.service, settings, fork_id).build()?;
    server.install_signal_handlers()?;
    server.start_file_watcher()?;
    tracing::info!(service = %args.service, fork = fork_id, "worker starting");
    Ok(server.run().exit_code())
}

fn run_call(args: CallArgs) -> Result<()> {
    let path = settings_path(args.settings)?;
    let settings = ServerSettings::load(&path)?;

    // The textual serializer doubles as the bridge between command-line
    // JSON and the wire value model.
    let json = JsonSerializer;
    let body = json
        .decode(args.body.as_bytes())
        .context("request body must be a JSON object")?;

    let client = Client::new(HashMap::from([(
        args.service.clone(),
        ClientConfig::redis(settings.transport),
    )]));
    let mut options = CallOptions::default();
    if let Some(timeout) = args.timeout {
        options.timeout = Some(Duration::from_secs(timeout));
    }

    let response = client.call_action(&args.service, &args.action, body, &options)?;
    let encoded = json.encode(&response.body)?;
    println!("{}", String::from_utf8_lossy(&encoded));
    Ok(())
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep stdout clean for `call` so output can be piped to jq and
    // friends; everything else gets structured logs.
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => {
            let exit_code = run_serve(args)?;
            std::process::exit(exit_code);
        }
        Commands::Call(args) => run_call(args),
    }
}
