// tunbox library crate
//
// The binary is a thin clap front-end over these modules; a desktop shell
// would drive `supervisor::Supervisor` directly and subscribe to `events`.

// App infrastructure
pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;

// Persisted state and link parsing
pub mod link;
pub mod settings;
pub mod store;

// Engine configuration and session lifecycle
pub mod engine;
pub mod events;
pub mod logbuf;
pub mod supervisor;
pub mod telemetry;

// Host collaborators (blocking, behind traits)
pub mod installer;
pub mod privilege;
pub mod process;
pub mod processes;
pub mod sysproxy;

pub mod shared;
