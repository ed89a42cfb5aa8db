use tokio::sync::broadcast;

/// Process-wide signals observable by anything holding an [`EventBus`]
/// handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Emitted exactly once per completed shutdown, graceful or forced.
    Shutdown { worker_id: String },
}

/// Explicit event-dispatch handle passed to the worker at construction.
///
/// Cloning shares the underlying channel; subscribers may come and go and
/// emitting with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: WorkerEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(16)
    }
}
