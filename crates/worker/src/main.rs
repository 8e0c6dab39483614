use anyhow::Context;
use textguard_infra::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    textguard_observability::init();

    let config = PipelineConfig::load().context("loading configuration")?;
    let backends = textguard_worker::connect_backends(&config).await?;

    let slot = textguard_worker::model_slot(&config);
    let loader_slot = slot.clone();
    let loader_config = config.clone();
    let loader = tokio::task::spawn_blocking(move || {
        textguard_worker::load_model(&loader_slot, &loader_config)
    });

    let start_config = config.clone();
    let pipeline = tokio::task::spawn_blocking(move || {
        textguard_worker::Pipeline::start(backends, slot, &start_config)
    })
    .await
    .context("pipeline start task panicked")??;

    if let Err(err) = loader.await.context("model loader panicked")? {
        tracing::error!(error = %err, "model load failed; jobs will keep retrying");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    tokio::task::spawn_blocking(move || pipeline.shutdown())
        .await
        .context("pipeline shutdown task panicked")?;
    Ok(())
}
