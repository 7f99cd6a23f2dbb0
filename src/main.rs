use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    denbox::cli::run().await
}
