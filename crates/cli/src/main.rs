//! Stagehand CLI - Main Entry Point

#[tokio::main]
async fn main() {
    let code = stagehand_cli::run_cli(stagehand_cli::demo::catalog()).await;
    std::process::exit(code);
}
