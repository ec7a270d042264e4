//! Scoped task groups with cooperative cancellation.
//!
//! Two scopes exist at runtime: one group owned by the controller for the
//! lifetime of `run()`, and one per datapath for the lifetime of its
//! connection. Cancelling a group propagates to every member through a
//! shared token; members observe it at their next suspension point.

use std::cell::RefCell;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Tracing target for task lifecycle operations.
const TASKS_TARGET: &str = "ofmux::tasks";

/// Statistics from joining a group.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JoinOutcome {
    /// Tasks that finished within the deadline.
    pub(crate) joined: usize,
    /// Tasks aborted because the deadline expired.
    pub(crate) abandoned: usize,
}

/// A set of cooperative tasks sharing one cancellation scope.
pub struct TaskGroup {
    scope: &'static str,
    token: CancellationToken,
    handles: RefCell<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    pub(crate) fn new(scope: &'static str) -> Self {
        Self {
            scope,
            token: CancellationToken::new(),
            handles: RefCell::new(Vec::new()),
        }
    }

    /// Spawns a task into the group.
    ///
    /// The task races the group's cancellation token, so it ends at its
    /// next suspension point once the group is cancelled.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let token = self.token.clone();
        let handle = tokio::task::spawn_local(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = future => {}
            }
        });
        let mut handles = self.handles.borrow_mut();
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    /// Requests cancellation of every member.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the group has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks not yet finished.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut handles = self.handles.borrow_mut();
        handles.retain(|handle| !handle.is_finished());
        handles.len()
    }

    /// Whether the group currently has no live tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for every member to finish, aborting stragglers once the
    /// deadline expires.
    pub(crate) async fn join(&self, deadline: Duration) -> JoinOutcome {
        let handles: Vec<JoinHandle<()>> = self.handles.borrow_mut().drain(..).collect();
        let mut outcome = JoinOutcome::default();
        let expiry = time::sleep(deadline);
        tokio::pin!(expiry);

        for mut handle in handles {
            tokio::select! {
                () = &mut expiry => {
                    handle.abort();
                    outcome.abandoned += 1;
                }
                result = &mut handle => {
                    outcome.joined += 1;
                    if let Err(join_error) = result {
                        if join_error.is_panic() {
                            error!(
                                target: TASKS_TARGET,
                                scope = self.scope,
                                "task panicked: {join_error}"
                            );
                        }
                    }
                }
            }
        }

        if outcome.abandoned > 0 {
            warn!(
                target: TASKS_TARGET,
                scope = self.scope,
                abandoned = outcome.abandoned,
                deadline_ms = deadline.as_millis() as u64,
                "abandoning tasks that outlived the shutdown grace window"
            );
        }
        outcome
    }

    /// Cancels the group and joins it within the deadline.
    pub(crate) async fn close(&self, deadline: Duration) -> JoinOutcome {
        self.cancel();
        self.join(deadline).await
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TaskGroup")
            .field("scope", &self.scope)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}
