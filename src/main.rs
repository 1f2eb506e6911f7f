#[tokio::main]
async fn main() -> anyhow::Result<()> {
    affect_sync::run().await
}
