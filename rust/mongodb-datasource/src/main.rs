use mongodb_datasource::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    mongodb_datasource::run().await
}
