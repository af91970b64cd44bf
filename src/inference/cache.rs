use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use candle_core::Device;
use tokio::sync::OnceCell;
use tracing::info;

use crate::inference::task::{ModelSize, SpeechModel};

/// Constructs a model handle, this is expensive and blocking.
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        size: ModelSize,
        device: &Device,
        half_precision: bool,
    ) -> Result<Arc<dyn SpeechModel>>;
}

type Slot = Arc<OnceCell<Arc<dyn SpeechModel>>>;

/// Lazily loaded models, one per size, kept for the lifetime of the process.
///
/// Concurrent requests for a size that is not loaded yet wait on the same
/// slot so the loader runs once per size. A failed load leaves the slot
/// empty and the next request tries again.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    device: Device,
    slots: Mutex<HashMap<ModelSize, Slot>>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>, device: Device) -> Self {
        Self {
            loader,
            device,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Weights are kept in f16 whenever a GPU does the work
    pub fn half_precision(&self) -> bool {
        self.device.is_cuda()
    }

    pub async fn get(&self, size: ModelSize) -> Result<Arc<dyn SpeechModel>> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| anyhow!("Model cache lock poisoned"))?;
            slots.entry(size).or_default().clone()
        };

        if let Some(model) = slot.get() {
            return Ok(model.clone());
        }

        // Loading runs in its own task, the slot is filled even if this caller is dropped
        let loader = self.loader.clone();
        let device = self.device.clone();
        let half_precision = self.half_precision();
        let init = tokio::spawn(async move {
            slot.get_or_try_init(|| async move {
                info!("Loading whisper model '{size}' on {device:?}");
                let model = tokio::task::spawn_blocking(move || {
                    loader.load(size, &device, half_precision)
                })
                .await??;
                Ok::<_, anyhow::Error>(model)
            })
            .await
            .cloned()
        });
        init.await?
    }

    /// Loads the model ahead of the first request for it
    pub async fn preload(&self, size: ModelSize) -> Result<()> {
        self.get(size).await.map(|_| ())
    }

    pub fn loaded(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.values().filter(|slot| slot.initialized()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::bail;

    use super::*;
    use crate::inference::task::{TranscribeOptions, Transcript};

    struct StaticModel {
        size: ModelSize,
    }

    impl SpeechModel for StaticModel {
        fn transcribe(&self, _: &Path, _: &TranscribeOptions) -> Result<Transcript> {
            Ok(Transcript {
                text: Some(self.size.to_string()),
                ..Default::default()
            })
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
        delay: Duration,
        failures_left: AtomicUsize,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, size: ModelSize, _: &Device, _: bool) -> Result<Arc<dyn SpeechModel>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("checkpoint download failed")
            }
            Ok(Arc::new(StaticModel { size }))
        }
    }

    #[tokio::test]
    async fn same_size_is_loaded_once() {
        let loader = Arc::new(CountingLoader::default());
        let cache = ModelCache::new(loader.clone(), Device::Cpu);

        let first = cache.get(ModelSize::Small).await.unwrap();
        for _ in 0..5 {
            let again = cache.get(ModelSize::Small).await.unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.loaded(), 1);
    }

    #[tokio::test]
    async fn each_size_gets_its_own_model() {
        let loader = Arc::new(CountingLoader::default());
        let cache = ModelCache::new(loader.clone(), Device::Cpu);

        let tiny = cache.get(ModelSize::Tiny).await.unwrap();
        let large = cache.get(ModelSize::Large).await.unwrap();
        assert!(!Arc::ptr_eq(&tiny, &large));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.loaded(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_load() {
        let loader = Arc::new(CountingLoader {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let cache = Arc::new(ModelCache::new(loader.clone(), Device::Cpu));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(ModelSize::Medium).await.unwrap() })
            })
            .collect();
        let mut models = vec![];
        for handle in handles {
            models.push(handle.await.unwrap());
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(models.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let loader = Arc::new(CountingLoader {
            failures_left: AtomicUsize::new(1),
            ..Default::default()
        });
        let cache = ModelCache::new(loader.clone(), Device::Cpu);

        let err = cache.get(ModelSize::Base).await.err().unwrap();
        assert_eq!(err.to_string(), "checkpoint download failed");
        assert_eq!(cache.loaded(), 0);

        cache.preload(ModelSize::Base).await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.loaded(), 1);
    }

    #[tokio::test]
    async fn abandoned_load_still_fills_the_slot() {
        let loader = Arc::new(CountingLoader {
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let cache = ModelCache::new(loader.clone(), Device::Cpu);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), cache.get(ModelSize::Small)).await;
        assert!(abandoned.is_err());

        cache.get(ModelSize::Small).await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.loaded(), 1);
    }

    #[test]
    fn cpu_runs_full_precision() {
        let cache = ModelCache::new(Arc::new(CountingLoader::default()), Device::Cpu);
        assert!(!cache.half_precision());
    }
}
