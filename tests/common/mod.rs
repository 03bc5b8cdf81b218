#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use media_converter::config::ConverterConfig;
use media_converter::models::ConversionTask;
use media_converter::services::conversion_worker::{ConsumerExit, ConversionWorker};
use media_converter::services::converter::NativeConverter;
use media_converter::services::queue::{DeliveryAcker, TaskDelivery, TaskQueue, TaskSubscription};
use media_converter::services::storage::{ObjectPage, StorageService};
use media_converter::utils::retry::RetryConfig;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory bucket with failure switches.
pub struct MockStorage {
    objects: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
    page_size: usize,
    pub fail_uploads: AtomicBool,
    pub fail_deletes: AtomicBool,
    /// Deletes report success but leave the object in place
    pub ghost_deletes: AtomicBool,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size,
            fail_uploads: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            ghost_deletes: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data.to_vec(), "application/octet-stream".to_string()));
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|(d, _)| d.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().unwrap().get(key).map(|(_, ct)| ct.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl StorageService for MockStorage {
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ObjectPage> {
        let objects = self.objects.lock().unwrap();
        let matching: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| continuation.as_deref().is_none_or(|after| k.as_str() > after))
            .cloned()
            .collect();

        let keys: Vec<String> = matching.iter().take(self.page_size).cloned().collect();
        let continuation = (matching.len() > keys.len())
            .then(|| keys.last().cloned())
            .flatten();
        Ok(ObjectPage { keys, continuation })
    }

    async fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        self.get(key).ok_or_else(|| anyhow!("NoSuchKey: {}", key))
    }

    async fn upload_file(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(anyhow!("upload refused"));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(())
    }

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| anyhow!("NoSuchKey: {}", source_key))?;
        objects.insert(dest_key.to_string(), object);
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(anyhow!("delete refused"));
        }
        if !self.ghost_deletes.load(Ordering::SeqCst) {
            self.objects.lock().unwrap().remove(key);
        }
        Ok(())
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

/// In-memory broker: one FIFO queue, a dead-letter list and unacked
/// bookkeeping.
#[derive(Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<Vec<u8>>>,
    unacked: AtomicUsize,
    pub acked: AtomicUsize,
    pub dead: Mutex<Vec<(Vec<u8>, String)>>,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_raw(&self, payload: &[u8]) {
        self.pending.lock().unwrap().push_back(payload.to_vec());
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn unacked(&self) -> usize {
        self.unacked.load(Ordering::SeqCst)
    }

    pub fn pending_keys(&self) -> Vec<String> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .map(|p| ConversionTask::decode(p).unwrap().s3key)
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<(Vec<u8>, String)> {
        self.dead.lock().unwrap().clone()
    }

    /// Subscription that ends once nothing is pending.
    pub fn subscribe(self: &Arc<Self>) -> MemorySubscription {
        MemorySubscription {
            queue: self.clone(),
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: &ConversionTask) -> Result<()> {
        self.push_raw(&task.encode());
        Ok(())
    }

    async fn dead_letter(&self, payload: &[u8], reason: &str) -> Result<()> {
        self.dead
            .lock()
            .unwrap()
            .push((payload.to_vec(), reason.to_string()));
        Ok(())
    }

    /// Ready messages only, like the broker's `message_count`.
    async fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

pub struct MemorySubscription {
    queue: Arc<MemoryQueue>,
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    payload: Vec<u8>,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.queue.unacked.fetch_sub(1, Ordering::SeqCst);
        self.queue.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn requeue(&self) -> Result<()> {
        self.queue.unacked.fetch_sub(1, Ordering::SeqCst);
        self.queue.push_raw(&self.payload);
        Ok(())
    }
}

#[async_trait]
impl TaskSubscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<TaskDelivery>> {
        let payload = self.queue.pending.lock().unwrap().pop_front()?;
        self.queue.unacked.fetch_add(1, Ordering::SeqCst);
        let acker = MemoryAcker {
            queue: self.queue.clone(),
            payload: payload.clone(),
        };
        Some(Ok(TaskDelivery::new(payload, Box::new(acker))))
    }
}

/// Pipeline configuration rooted in a test directory, in-process converter.
pub fn test_config(root: &Path) -> ConverterConfig {
    ConverterConfig {
        staging_root: root.join("tmp"),
        ..ConverterConfig::development()
    }
}

pub fn worker(storage: &Arc<MockStorage>, config: ConverterConfig) -> ConversionWorker {
    ConversionWorker::new(storage.clone(), Arc::new(NativeConverter), config)
        .with_retry(RetryConfig::immediate(2))
}

/// Consumes until the queue has nothing left to deliver.
pub async fn drain(worker: &ConversionWorker, queue: &Arc<MemoryQueue>) -> ConsumerExit {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    worker
        .run(queue.subscribe(), queue.as_ref(), shutdown_rx)
        .await
}

/// Stand-in for a camera upload: any decodable image works for the
/// in-process converter, whatever the key's extension says.
pub fn photo_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
    });
    let mut data = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut data), ImageFormat::Png)
        .unwrap();
    data
}
