use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::core::catalog::types::ExecutorRecord;
use crate::core::error::InvokeError;

/// One semaphore per executor id, sized by the executor's concurrency limit
/// the first time it is seen.
#[derive(Default)]
pub struct ExecutorLimits {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ExecutorLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, executor: &ExecutorRecord) -> Result<OwnedSemaphorePermit, InvokeError> {
        let semaphore = {
            let mut map = self.semaphores.lock().await;
            map.entry(executor.id.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(executor.max_concurrency.max(1) as usize)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| InvokeError::Internal(anyhow!("executor {} limiter closed", executor.id)))
    }

    pub async fn available(&self, executor_id: &str) -> Option<usize> {
        self.semaphores
            .lock()
            .await
            .get(executor_id)
            .map(|s| s.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing;
    use std::time::Duration;

    #[tokio::test]
    async fn permits_are_bounded_per_executor() {
        let limits = ExecutorLimits::new();
        let mut narrow = testing::graph_executor("narrow", "http://unused");
        narrow.max_concurrency = 1;
        let wide = testing::http_executor("wide", "http://unused");

        let held = limits.acquire(&narrow).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), limits.acquire(&narrow)).await;
        assert!(blocked.is_err());

        // other executors are unaffected
        let _other = limits.acquire(&wide).await.unwrap();
        assert_eq!(limits.available("wide").await, Some(3));

        drop(held);
        assert!(limits.acquire(&narrow).await.is_ok());
    }
}
