//! Connects to whichever backend `queue.backend` names, mirroring
//! `fintask-worker`'s factory of the same name — kept as a separate copy
//! since the reaper binary has no dependency on the worker crate.

use std::sync::Arc;

use fintask_core::{BackendConfig, QueueBackend, QueueBackendKind, RetryParams};

pub async fn build_backend(
    config: &BackendConfig,
    retry: RetryParams,
) -> anyhow::Result<Arc<dyn QueueBackend>> {
    match config.backend {
        QueueBackendKind::Sql => {
            let cfg = &config.sql;
            let url = format!(
                "postgres://{}:{}@{}:{}/{}",
                cfg.user, cfg.password, cfg.host, cfg.port, cfg.database
            );
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(4)
                .connect(&url)
                .await?;
            Ok(Arc::new(fintask_backend_sql::PgBackend::with_retry_params(
                pool, retry,
            )))
        }
        QueueBackendKind::Kv => {
            let cfg = &config.kv;
            let url = match &cfg.password {
                Some(password) => format!("redis://:{password}@{}:{}/{}", cfg.host, cfg.port, cfg.keyspace),
                None => format!("redis://{}:{}/{}", cfg.host, cfg.port, cfg.keyspace),
            };
            let pool = deadpool_redis::Config::from_url(url)
                .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
            Ok(Arc::new(fintask_backend_kv::RedisBackend::with_retry_params(
                pool, retry,
            )))
        }
        QueueBackendKind::Amqp => {
            let cfg = &config.amqp;
            let url = format!(
                "amqp://{}:{}@{}:{}/{}",
                cfg.user, cfg.password, cfg.host, cfg.port, cfg.vhost
            );
            let connection =
                lapin::Connection::connect(&url, lapin::ConnectionProperties::default()).await?;
            let channel = connection.create_channel().await?;
            let backend = fintask_backend_amqp::AmqpBackend::new(channel)
                .await?
                .with_retry_params(retry);
            Ok(Arc::new(backend))
        }
        QueueBackendKind::Pubsub => {
            let cfg = &config.pubsub;
            let mut options =
                rumqttc::v5::MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
            if let (Some(user), Some(password)) = (&cfg.user, &cfg.password) {
                options.set_credentials(user.clone(), password.clone());
            }
            let (client, eventloop) = rumqttc::v5::AsyncClient::new(options, 256);
            let backend =
                fintask_backend_pubsub::MqttBackend::with_retry_params(client, eventloop, retry);
            Ok(Arc::new(backend))
        }
    }
}
