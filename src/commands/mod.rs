// ABOUTME: Command implementations behind the CLI subcommands
// ABOUTME: Exports sync, reporting, setup, and event commands

pub mod event;
pub mod report;
pub mod setup;
pub mod sync;

pub use event::event;
pub use report::{due, info};
pub use setup::{check, init};
pub use sync::{run, sync_page, watch};
