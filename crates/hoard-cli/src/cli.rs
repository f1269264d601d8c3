use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub cmd: OptsCmd,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Base directory for the database and file store.
    #[arg(long, env = "HOARD_DB_DIR", default_value = "./db")]
    pub db_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum OptsCmd {
    /// Run the server in the foreground.
    Start,
    /// Ask a running instance to shut down.
    Stop,
    /// Stop any running instance, then start.
    Restart,
}
