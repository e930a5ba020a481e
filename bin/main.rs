//! Flowtest CLI Entry Point
//!
//! This binary replays multi-turn test cases against a chat API.

use std::process;

#[tokio::main]
async fn main() {
    if let Err(e) = flowtest_interface::run_cli().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
