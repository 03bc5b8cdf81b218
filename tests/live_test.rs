//! Against real services. Start them with:
//!
//! ```bash
//! docker run -d --name minio -p 9000:9000 minio/minio server /data
//! docker run -d --name rabbitmq -p 5672:5672 rabbitmq:3
//! ```

use media_converter::config::{QueueConfig, StorageConfig};
use media_converter::infrastructure::{queue, storage};
use media_converter::models::ConversionTask;
use media_converter::services::queue::{TaskQueue, TaskSubscription};
use media_converter::services::storage::StorageService;

fn minio() -> StorageConfig {
    StorageConfig {
        endpoint: "http://127.0.0.1:9000".to_string(),
        access_key: "minioadmin".to_string(),
        secret_key: "minioadmin".to_string(),
        bucket: "converter-test".to_string(),
        region: "us-east-1".to_string(),
    }
}

#[tokio::test]
#[ignore = "requires MinIO on 127.0.0.1:9000"]
async fn test_s3_object_lifecycle() {
    let storage = storage::setup_storage(&minio()).await;
    let key = format!("live/{}.txt", uuid::Uuid::new_v4());

    storage
        .upload_file(&key, b"hello".to_vec(), "text/plain")
        .await
        .unwrap();
    assert!(storage.file_exists(&key).await.unwrap());
    assert!(storage.list_objects("live/").await.unwrap().contains(&key));
    assert_eq!(storage.get_file(&key).await.unwrap(), b"hello");

    let copy = format!("{key}.copy");
    storage.copy_object(&key, &copy).await.unwrap();
    storage.delete_file(&key).await.unwrap();
    storage.delete_file(&copy).await.unwrap();
    assert!(!storage.file_exists(&key).await.unwrap());
    assert!(!storage.file_exists(&copy).await.unwrap());
}

#[tokio::test]
#[ignore = "requires RabbitMQ on 127.0.0.1:5672"]
async fn test_amqp_enqueue_consume_ack() {
    let config = QueueConfig {
        converter_queue: format!("converter-test-{}", uuid::Uuid::new_v4()),
        ..QueueConfig::default()
    };
    let task_queue = queue::setup_queue(&config).await.unwrap();
    assert!(task_queue.is_empty().await);

    let task = ConversionTask::new("live/a.heic");
    task_queue.enqueue(&task).await.unwrap();

    let mut subscription = task_queue.subscribe("live-test").await.unwrap();
    let delivery = subscription.next_delivery().await.unwrap().unwrap();
    assert_eq!(ConversionTask::decode(&delivery.payload).unwrap(), task);
    delivery.ack().await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(task_queue.is_empty().await);
}
