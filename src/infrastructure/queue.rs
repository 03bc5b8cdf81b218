use crate::config::QueueConfig;
use crate::services::queue::AmqpTaskQueue;
use std::sync::Arc;
use tracing::info;

pub async fn setup_queue(config: &QueueConfig) -> anyhow::Result<Arc<AmqpTaskQueue>> {
    info!(
        "🐇 RabbitMQ: {}:{} (Queue: {})",
        config.host, config.port, config.converter_queue
    );

    let queue = AmqpTaskQueue::connect(config).await?;
    info!(
        "✅ Queue '{}' and '{}' declared",
        queue.queue_name(),
        config.dead_letter_queue()
    );

    Ok(Arc::new(queue))
}
