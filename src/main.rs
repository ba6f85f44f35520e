use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    sandbox_bridge::cli::run().await
}
