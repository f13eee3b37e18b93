pub mod build_info;
pub mod cli;
pub mod command;
pub mod config;
pub mod daemon;
pub mod ini;
pub mod launcher;
pub mod log;
pub mod pipes;
pub mod reconcile;
pub mod table;
pub mod watcher;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
