// feedveil - main.rs
// Thin entrypoint; everything lives in the library

use clap::Parser;
use feedveil::cli::{dispatch, Cli};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dispatch(Cli::parse()).await
}
