use async_trait::async_trait;
use tokio::sync::watch;

use super::{LimitAlgorithm, Sample};

/// A simple, fixed concurrency limit.
#[derive(Debug)]
pub struct Fixed {
    limit: usize,
    changed: watch::Sender<usize>,
}

impl Fixed {
    #[allow(missing_docs)]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0);

        let (changed, _) = watch::channel(limit);
        Self { limit, changed }
    }
}

#[async_trait]
impl LimitAlgorithm for Fixed {
    fn limit(&self) -> usize {
        self.limit
    }

    fn subscribe(&self) -> watch::Receiver<usize> {
        self.changed.subscribe()
    }

    async fn update(&self, _sample: Sample) -> usize {
        self.limit
    }
}
