//! The soarpc server engine.
//!
//! A [`Server`] dequeues jobs for a single named service, validates and
//! executes each contained action through user-registered handlers (inside
//! the middleware onion), and sends back an aggregated response. Around
//! that core sit the worker-lifecycle pieces: the harakiri watchdog, the
//! heartbeat file, the multi-process supervisor with crash-budgeted
//! respawn, signal-driven graceful shutdown, and the optional auto-reload
//! file watcher.
//!
//! # Example
//!
//! ```no_run
//! use soarpc_server::{ActionRegistration, ServerBuilder, ServerSettings};
//!
//! let server = ServerBuilder::new("example", ServerSettings::default())
//!     .action(
//!         "echo",
//!         ActionRegistration::new(|request| Ok(request.body.clone()))
//!             .with_description("Returns the request body unchanged."),
//!     )
//!     .build()
//!     .unwrap();
//! server.install_signal_handlers().unwrap();
//! std::process::exit(server.run().exit_code());
//! ```

mod action;
mod autoreload;
mod errors;
mod harakiri;
mod heartbeat;
mod middleware;
mod schemas;
mod server;
mod settings;
mod supervisor;
mod types;

pub use action::{ActionHandler, ActionRegistration, Validator};
pub use autoreload::spawn_file_watcher;
pub use errors::{ActionError, JobError, ServerError};
pub use harakiri::EXIT_CODE_HARAKIRI;
pub use middleware::{ActionNext, JobNext, ServerMiddleware};
pub use schemas::validate_job_request;
pub use server::{RunOutcome, Server, ServerBuilder, ServerHooks};
pub use settings::{
    settings_path_from_env, FileWatcherSettings, HarakiriSettings, ServerSettings,
    SettingsError, SETTINGS_ENV,
};
pub use supervisor::{
    forked_process_id, run_supervisor, SupervisorOptions, EXIT_CODE_RELOAD, FORK_ID_ENV,
};
pub use types::{EnrichedActionRequest, EnrichedJobRequest};
