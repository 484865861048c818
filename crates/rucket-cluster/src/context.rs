//! Per-node lifecycle state shared by the bootstrap tasks and request handlers.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{BootstrapError, Result};

/// Lifecycle stage of a gateway node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    /// Still determining its role.
    Starting,
    /// Accepting control-plane requests.
    NodeStarted,
    /// The cluster finished its startup.
    ClusterStarted,
}

#[derive(Debug, Default)]
struct Flags {
    vote_in_progress: bool,
    rebalance_pending: bool,
    rebalance_starting_up: bool,
}

/// Shared node context: lifecycle flags plus the shutdown signal.
#[derive(Debug)]
pub struct NodeContext {
    lifecycle: watch::Sender<Lifecycle>,
    shutdown: watch::Sender<bool>,
    flags: Mutex<Flags>,
}

impl Default for NodeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeContext {
    /// Creates a context in the `Starting` stage.
    #[must_use]
    pub fn new() -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Starting);
        let (shutdown, _) = watch::channel(false);
        Self { lifecycle, shutdown, flags: Mutex::new(Flags::default()) }
    }

    /// Current lifecycle stage.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Marks the node as accepting control-plane requests.
    pub fn mark_node_started(&self) {
        self.advance(Lifecycle::NodeStarted);
    }

    /// Marks the cluster as started. Never goes back.
    pub fn mark_cluster_started(&self) {
        self.advance(Lifecycle::ClusterStarted);
    }

    fn advance(&self, to: Lifecycle) {
        self.lifecycle.send_if_modified(|stage| {
            if *stage < to {
                *stage = to;
                true
            } else {
                false
            }
        });
    }

    /// Whether the node accepts control-plane requests.
    #[must_use]
    pub fn is_node_started(&self) -> bool {
        self.lifecycle() >= Lifecycle::NodeStarted
    }

    /// Whether the cluster finished its startup.
    #[must_use]
    pub fn is_cluster_started(&self) -> bool {
        self.lifecycle() == Lifecycle::ClusterStarted
    }

    /// Waits until the cluster is started.
    pub async fn wait_cluster_started(&self) {
        let mut rx = self.lifecycle.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stage| *stage == Lifecycle::ClusterStarted).await;
    }

    /// Signals shutdown to every waiting task.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Shutdown`] if the node is stopping.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let mut rx = self.shutdown.subscribe();
        if *rx.borrow_and_update() {
            return Err(BootstrapError::Shutdown);
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            _ = rx.wait_for(|stopping| *stopping) => Err(BootstrapError::Shutdown),
        }
    }

    /// Returns an error if shutdown was requested.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Shutdown`] if the node is stopping.
    pub fn check_stopping(&self) -> Result<()> {
        if self.is_stopping() {
            Err(BootstrapError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Whether this node currently takes part in a primary election.
    #[must_use]
    pub fn vote_in_progress(&self) -> bool {
        self.flags.lock().vote_in_progress
    }

    /// Sets the election flag.
    pub fn set_vote_in_progress(&self, value: bool) {
        self.flags.lock().vote_in_progress = value;
    }

    /// Whether an interrupted rebalance waits to be resumed.
    #[must_use]
    pub fn rebalance_pending(&self) -> bool {
        self.flags.lock().rebalance_pending
    }

    /// Sets the pending-rebalance flag.
    pub fn set_rebalance_pending(&self, value: bool) {
        self.flags.lock().rebalance_pending = value;
    }

    /// Whether membership-triggered rebalance is suppressed.
    #[must_use]
    pub fn rebalance_starting_up(&self) -> bool {
        self.flags.lock().rebalance_starting_up
    }

    /// Suppresses membership-triggered rebalance until the startup ends.
    pub fn begin_rebalance_startup(&self) {
        self.flags.lock().rebalance_starting_up = true;
    }

    /// Lifts the suppression. Returns whether it was set.
    pub fn end_rebalance_startup(&self) -> bool {
        std::mem::replace(&mut self.flags.lock().rebalance_starting_up, false)
    }
}
