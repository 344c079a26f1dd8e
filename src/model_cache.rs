use crate::model_service::ModelError;
use std::sync::Arc;
use tokio::sync::OnceCell;

type Loader<M> = Box<dyn Fn() -> Result<M, ModelError> + Send + Sync>;

/// Process-wide handle to a loaded model. The loader runs on first access
/// and every later call shares the same instance.
pub struct ModelCache<M> {
    cell: OnceCell<Arc<M>>,
    loader: Loader<M>,
}

impl<M: Send + Sync + 'static> ModelCache<M> {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<M, ModelError> + Send + Sync + 'static,
    {
        Self {
            cell: OnceCell::new(),
            loader: Box::new(loader),
        }
    }

    /// Returns the memoized handle, loading it if this is the first call.
    /// A failed load is returned to the caller and leaves the cache empty.
    pub async fn get_or_load(&self) -> Result<Arc<M>, ModelError> {
        let model = self
            .cell
            .get_or_try_init(|| async {
                tracing::info!("Loading model");
                (self.loader)().map(Arc::new)
            })
            .await?;

        Ok(model.clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DummyModel {
        id: usize,
    }

    #[tokio::test]
    async fn test_returns_same_handle() -> Result<(), ModelError> {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let cache = ModelCache::new(move || {
            let id = counter.fetch_add(1, Ordering::SeqCst);
            Ok(DummyModel { id })
        });

        assert!(!cache.is_loaded());
        let first = cache.get_or_load().await?;
        let second = cache.get_or_load().await?;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id, 0);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(cache.is_loaded());

        Ok(())
    }

    #[tokio::test]
    async fn test_load_failure_propagates() {
        let cache: ModelCache<DummyModel> =
            ModelCache::new(|| Err(ModelError::Load("weights/missing.onnx".to_string())));

        let result = cache.get_or_load().await;

        assert!(matches!(result, Err(ModelError::Load(_))));
        assert!(!cache.is_loaded());
    }
}
