#[tokio::main]
async fn main() -> anyhow::Result<()> {
    viewsync_server::run_server().await
}
