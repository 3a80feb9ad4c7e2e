#[tokio::main]
async fn main() {
    if let Err(err) = agenthub_server::app::run().await {
        tracing::error!(error = %err, "server stopped");
        eprintln!("agenthub-server: {err}");
        std::process::exit(1);
    }
}
