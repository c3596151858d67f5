use anyhow::Result;

use ollie::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli().await
}
