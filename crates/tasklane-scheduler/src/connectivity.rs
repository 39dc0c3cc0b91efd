use tasklane_core::Connectivity;
use tokio::sync::watch;
use tracing::info;

/// Source of connectivity state for the network constraint.
///
/// Dropping every sender behind `subscribe` tells waiting jobs that no further
/// change will ever arrive.
pub trait ConnectivityProvider: Send + Sync {
    fn current(&self) -> Connectivity;
    fn subscribe(&self) -> watch::Receiver<Connectivity>;
}

/// Provider driven by explicit `set` calls from the host (or a test).
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<Connectivity>,
}

impl ManualConnectivity {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new state; subscribers are only woken on an actual change.
    pub fn set(&self, connectivity: Connectivity) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connectivity {
                return false;
            }
            *current = connectivity;
            true
        });
        if changed {
            info!(?connectivity, "connectivity changed");
        }
    }
}

impl ConnectivityProvider for ManualConnectivity {
    fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}
