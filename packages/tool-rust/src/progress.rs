//! Progress of a restart or stop request over several nodes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dynconf_core::{Endpoint, LogicalServerState};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::node_states::NodeStates;
use crate::poll::{poll_until, PollOutcome};

type ReachedCallback = Box<dyn Fn(&Endpoint, LogicalServerState) + Send>;

/// Tracks nodes reaching an expected state after a request.
///
/// Dropping the progress stops its pollers; requests already sent to nodes
/// are not cancelled.
pub struct NodeProgress {
    errors: Vec<(Endpoint, String)>,
    reached: NodeStates,
    pending: usize,
    events: Option<mpsc::UnboundedReceiver<(Endpoint, LogicalServerState)>>,
    callbacks: Vec<ReachedCallback>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for NodeProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeProgress")
            .field("errors", &self.errors)
            .field("reached", &self.reached)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl NodeProgress {
    /// Progress whose outcome is already known.
    #[must_use]
    pub fn settled(errors: Vec<(Endpoint, String)>, reached: NodeStates) -> Self {
        Self {
            errors,
            reached,
            pending: 0,
            events: None,
            callbacks: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Spawns one poller per endpoint on a pool of `concurrency` permits.
    ///
    /// Each poller waits `initial_wait`, then calls `probe` every `interval`
    /// until it yields the state the node reached.
    pub(crate) fn track<F, Fut>(
        endpoints: Vec<Endpoint>,
        errors: Vec<(Endpoint, String)>,
        concurrency: usize,
        initial_wait: Duration,
        interval: Duration,
        probe: F,
    ) -> Self
    where
        F: Fn(Endpoint) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<LogicalServerState>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let probe = Arc::new(probe);
        let pending = endpoints.len();
        let tasks = endpoints
            .into_iter()
            .map(|endpoint| {
                let tx = tx.clone();
                let semaphore = Arc::clone(&semaphore);
                let probe = Arc::clone(&probe);
                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    tokio::time::sleep(initial_wait).await;
                    let outcome = poll_until(interval, None, || (*probe)(endpoint.clone())).await;
                    if let PollOutcome::Settled(state) = outcome {
                        debug!("{endpoint} reached state {state}");
                        let _ = tx.send((endpoint, state));
                    }
                })
            })
            .collect();
        Self {
            errors,
            reached: NodeStates::new(),
            pending,
            events: Some(rx),
            callbacks: Vec::new(),
            tasks,
        }
    }

    /// Nodes whose request could not be sent, with the reason.
    #[must_use]
    pub fn errors(&self) -> &[(Endpoint, String)] {
        &self.errors
    }

    /// Registers a callback for nodes reaching their state. Nodes that
    /// already reached it are replayed immediately.
    pub fn on_reached(&mut self, callback: impl Fn(&Endpoint, LogicalServerState) + Send + 'static) {
        for (endpoint, state) in self.reached.iter() {
            callback(endpoint, state);
        }
        self.callbacks.push(Box::new(callback));
    }

    /// Waits up to `timeout` for the tracked nodes and returns every node
    /// that reached its state so far.
    pub async fn await_reached(&mut self, timeout: Duration) -> NodeStates {
        let deadline = Instant::now() + timeout;
        while self.pending > 0 {
            let Some(events) = self.events.as_mut() else {
                break;
            };
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some((endpoint, state))) => {
                    self.pending -= 1;
                    for callback in &self.callbacks {
                        callback(&endpoint, state);
                    }
                    self.reached.insert(endpoint, state);
                }
                Ok(None) | Err(_) => break,
            }
        }
        self.reached.clone()
    }
}

impl Drop for NodeProgress {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dynconf_core::{AddressGroup, HostPort};

    use super::*;

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::new(name.parse().unwrap(), name, HostPort::new(name, 9410), AddressGroup::Internal)
    }

    #[tokio::test(start_paused = true)]
    async fn collects_nodes_that_reach_state_before_deadline() {
        let mut progress = NodeProgress::track(
            vec![endpoint("fast"), endpoint("never")],
            vec![],
            2,
            Duration::from_secs(1),
            Duration::from_secs(1),
            |e: Endpoint| async move { (e.node_name == "fast").then_some(LogicalServerState::Active) },
        );
        let reached = progress.await_reached(Duration::from_secs(30)).await;
        assert_eq!(reached.len(), 1);
        assert_eq!(reached.get(&"fast".parse().unwrap()), Some(LogicalServerState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_replay_already_reached_nodes() {
        let mut progress = NodeProgress::track(
            vec![endpoint("a")],
            vec![],
            1,
            Duration::from_secs(1),
            Duration::from_secs(1),
            |_| async { Some(LogicalServerState::Passive) },
        );
        progress.await_reached(Duration::from_secs(10)).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        progress.on_reached(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn settled_progress_returns_immediately() {
        let reached: NodeStates = [(endpoint("a"), LogicalServerState::Active)].into_iter().collect();
        let mut progress = NodeProgress::settled(vec![(endpoint("b"), "refused".into())], reached);
        assert_eq!(progress.errors().len(), 1);
        assert_eq!(progress.await_reached(Duration::from_secs(1)).await.len(), 1);
    }
}
