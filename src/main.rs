#[tokio::main]
async fn main() -> anyhow::Result<()> {
    aweb::run().await
}
