//! `textguard-worker`
//!
//! Wires the configured backends into a running scoring pipeline: a pool of
//! scoring workers plus the retention sweeper.

use std::sync::Arc;

use anyhow::Context;
use textguard_infra::{
    InMemoryPredictionRepository, InMemoryTaskQueue, MaintenanceSweeper, PipelineConfig,
    PostgresPredictionRepository, PredictionRepository, ScoringWorker, SweeperHandle, TaskQueue,
    WorkerPool,
};
use textguard_scoring::{LinearTextClassifier, ModelSlot, ScoringEngine};

pub type SharedRepository = Arc<dyn PredictionRepository>;
pub type SharedQueue = Arc<dyn TaskQueue>;

/// Backends selected from configuration.
pub struct Backends {
    pub repository: SharedRepository,
    pub queue: SharedQueue,
}

/// Pick storage and queue backends.
///
/// Postgres is used when `database_url` is set, Redis when `redis_url` is set
/// and the `redis` feature is enabled; otherwise the in-process versions.
pub async fn connect_backends(config: &PipelineConfig) -> anyhow::Result<Backends> {
    let repository: SharedRepository = match &config.database_url {
        Some(url) => {
            let repo = PostgresPredictionRepository::connect(url)
                .await
                .context("connecting to postgres")?;
            tracing::info!(backend = "postgres", "prediction store ready");
            Arc::new(repo)
        }
        None => {
            tracing::warn!(backend = "memory", "no database_url configured; records are not durable");
            Arc::new(InMemoryPredictionRepository::new())
        }
    };

    Ok(Backends {
        repository,
        queue: connect_queue(config)?,
    })
}

#[cfg(feature = "redis")]
fn connect_queue(config: &PipelineConfig) -> anyhow::Result<SharedQueue> {
    if let Some(url) = &config.redis_url {
        let queue = textguard_infra::RedisTaskQueue::new(url, None, config.visibility_timeout())
            .context("opening redis queue")?
            .with_poll_interval(config.poll_interval());
        tracing::info!(backend = "redis", "task queue ready");
        return Ok(Arc::new(queue));
    }
    Ok(in_memory_queue(config))
}

#[cfg(not(feature = "redis"))]
fn connect_queue(config: &PipelineConfig) -> anyhow::Result<SharedQueue> {
    if config.redis_url.is_some() {
        tracing::warn!("redis_url is set but the redis feature is disabled; using in-memory queue");
    }
    Ok(in_memory_queue(config))
}

fn in_memory_queue(config: &PipelineConfig) -> SharedQueue {
    tracing::info!(backend = "memory", "task queue ready");
    Arc::new(InMemoryTaskQueue::new(config.visibility_timeout()))
}

/// Engine slot filled by [`load_model`]; scoring fails as unavailable until then.
pub fn model_slot(config: &PipelineConfig) -> Arc<ModelSlot<LinearTextClassifier>> {
    Arc::new(ModelSlot::new(config.model_version.clone()))
}

/// Load the configured model artifact into `slot`.
///
/// Returns `Ok(false)` when no model path is configured.
pub fn load_model(
    slot: &ModelSlot<LinearTextClassifier>,
    config: &PipelineConfig,
) -> anyhow::Result<bool> {
    let Some(path) = &config.model_path else {
        tracing::warn!("no model_path configured; jobs will retry until a model is installed");
        return Ok(false);
    };

    let model = LinearTextClassifier::load(path)
        .with_context(|| format!("loading model from {}", path.display()))?;
    let version = model.model_version().to_string();
    if slot.install(model).is_err() {
        anyhow::bail!("model slot already holds a model");
    }
    tracing::info!(model_version = %version, path = %path.display(), "model installed");
    Ok(true)
}

/// Running pipeline threads.
pub struct Pipeline {
    workers: WorkerPool,
    sweeper: SweeperHandle,
}

impl Pipeline {
    /// Spawn the worker pool and the sweeper.
    ///
    /// Must be called off the async runtime's worker threads: backends may
    /// block on the runtime internally.
    pub fn start(
        backends: Backends,
        engine: Arc<dyn ScoringEngine>,
        config: &PipelineConfig,
    ) -> anyhow::Result<Self> {
        let worker = Arc::new(ScoringWorker::from_config(
            Arc::clone(&backends.repository),
            Arc::clone(&backends.queue),
            engine,
            config,
        ));
        let workers = worker
            .spawn_pool(config.worker_count)
            .context("spawning scoring workers")?;

        let sweeper = match MaintenanceSweeper::from_config(backends.repository, config)
            .spawn("retention-sweeper")
        {
            Ok(handle) => handle,
            Err(err) => {
                workers.shutdown();
                return Err(err).context("spawning retention sweeper");
            }
        };

        tracing::info!(workers = workers.len(), "pipeline started");
        Ok(Self { workers, sweeper })
    }

    /// Stop the sweeper, then drain the workers.
    pub fn shutdown(self) {
        self.sweeper.shutdown();
        self.workers.shutdown();
        tracing::info!("pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn temp_model(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "textguard-worker-model-{}-{}.json",
            std::process::id(),
            contents.len()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_model_path_leaves_slot_empty() {
        let config = PipelineConfig::default();
        let slot = model_slot(&config);
        assert!(!load_model(&slot, &config).unwrap());
        assert!(!slot.is_loaded());
        assert_eq!(slot.model_version(), "1.0");
    }

    #[test]
    fn load_model_installs_artifact() {
        let path = temp_model(r#"{"version":"lexicon-v9","bias":-1.0,"weights":{"idiot":3.0}}"#);
        let config = PipelineConfig {
            model_path: Some(path.clone()),
            ..PipelineConfig::default()
        };
        let slot = model_slot(&config);

        assert!(load_model(&slot, &config).unwrap());
        assert_eq!(slot.model_version(), "lexicon-v9");
        assert!(load_model(&slot, &config).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn defaults_select_in_memory_backends() {
        let config = PipelineConfig::default();
        let backends = connect_backends(&config).await.unwrap();
        assert!(
            backends
                .queue
                .dequeue(std::time::Duration::from_millis(1))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn pipeline_starts_and_stops() {
        let config = PipelineConfig {
            worker_count: 2,
            poll_interval_ms: 10,
            ..PipelineConfig::default()
        };
        let backends = Backends {
            repository: Arc::new(InMemoryPredictionRepository::new()),
            queue: Arc::new(InMemoryTaskQueue::new(config.visibility_timeout())),
        };
        let pipeline = Pipeline::start(backends, model_slot(&config), &config).unwrap();
        pipeline.shutdown();
    }
}
