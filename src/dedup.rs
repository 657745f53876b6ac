//! In-flight request deduplication.
//!
//! The outermost stage guarantees at most one concurrent downstream
//! execution per request fingerprint. The first caller for a fingerprint
//! becomes the leader and runs the rest of the chain; concurrent callers
//! with the same fingerprint park on a watch channel and receive a clone
//! of the leader's result, success or error, without re-executing
//! anything. The fingerprint is forgotten the moment the leader finishes,
//! so a subsequent identical call starts fresh.
//!
//! If the leader's future is dropped before completion (caller went away),
//! a drop guard removes the registry entry and the waiters observe the
//! closed channel; one of them is then promoted to leader on its next loop
//! iteration instead of waiting forever.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::pipeline::{CallContext, Next, Stage};
use crate::request::{Fingerprint, RequestSpec};
use crate::response::Response;

type Outcome = Option<Result<Response>>;

/// Stage collapsing concurrent identical requests into one execution.
#[derive(Debug, Default)]
pub struct RequestDeduplicator {
    inflight: Mutex<HashMap<Fingerprint, watch::Receiver<Outcome>>>,
}

enum Role {
    Leader(watch::Sender<Outcome>),
    Follower(watch::Receiver<Outcome>),
}

impl RequestDeduplicator {
    /// Creates an empty deduplicator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins an in-flight execution for `key`, or registers a new one.
    fn join_or_lead(&self, key: Fingerprint) -> Role {
        let mut inflight = self.lock();
        if let Some(rx) = inflight.get(&key) {
            return Role::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(key, rx);
        Role::Leader(tx)
    }

    fn forget(&self, key: &Fingerprint) {
        self.lock().remove(key);
    }

    /// In-flight fingerprints, for observability.
    pub fn inflight_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, watch::Receiver<Outcome>>> {
        self.inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Removes the registry entry if the leader never completes, so waiters
/// are not stranded behind a dropped execution.
struct LeaderGuard<'a> {
    dedup: &'a RequestDeduplicator,
    key: Fingerprint,
    armed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.dedup.forget(&self.key);
        }
    }
}

#[async_trait]
impl Stage for RequestDeduplicator {
    async fn handle(
        &self,
        ctx: &CallContext,
        spec: &RequestSpec,
        next: Next<'_>,
    ) -> Result<Response> {
        let key = spec.fingerprint();
        loop {
            match self.join_or_lead(key) {
                Role::Leader(tx) => {
                    let mut guard = LeaderGuard {
                        dedup: self,
                        key,
                        armed: true,
                    };
                    let result = next.run(ctx, spec).await;
                    // Forget before broadcasting: callers arriving after
                    // completion must start a fresh execution.
                    self.forget(&key);
                    guard.armed = false;
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Role::Follower(mut rx) => {
                    trace!("joining in-flight identical request");
                    loop {
                        if let Some(result) = rx.borrow_and_update().clone() {
                            debug!("request served from in-flight execution");
                            return result;
                        }
                        tokio::select! {
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    // Leader dropped without a result; race
                                    // for leadership on the next iteration.
                                    break;
                                }
                            }
                            _ = tokio::time::sleep_until(ctx.deadline()) => {
                                return Err(Error::timeout("call deadline elapsed"));
                            }
                            _ = ctx.cancel_token().cancelled() => {
                                return Err(Error::timeout("call cancelled"));
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashMap;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Terminal stage that parks on a gate, then returns a fixed outcome.
    struct GatedStage {
        calls: AtomicUsize,
        gate: Arc<tokio::sync::Notify>,
        fail: bool,
    }

    impl fmt::Debug for GatedStage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("GatedStage").finish()
        }
    }

    impl GatedStage {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Arc::new(tokio::sync::Notify::new()),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Stage for GatedStage {
        async fn handle(
            &self,
            _ctx: &CallContext,
            _spec: &RequestSpec,
            _next: Next<'_>,
        ) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                Err(Error::auth("session rejected"))
            } else {
                Ok(Response::new(200, HashMap::new(), &b"{\"ok\":true}"[..]))
            }
        }
    }

    fn ctx() -> CallContext {
        CallContext::new(Duration::from_secs(30), CancellationToken::new())
    }

    fn spec() -> RequestSpec {
        RequestSpec::get("https://api.example.com/v1/balance")
            .build()
            .unwrap()
    }

    async fn run_concurrent(
        count: usize,
        terminal: Arc<GatedStage>,
    ) -> Vec<Result<Response>> {
        let dedup = Arc::new(RequestDeduplicator::new());
        let mut handles = Vec::new();
        for _ in 0..count {
            let dedup = dedup.clone();
            let terminal = terminal.clone();
            handles.push(tokio::spawn(async move {
                let stages: Vec<Arc<dyn Stage>> = vec![terminal];
                dedup.handle(&ctx(), &spec(), Next::new(&stages)).await
            }));
        }
        // Let all callers register before releasing the leader.
        tokio::time::sleep(Duration::from_millis(20)).await;
        terminal.gate.notify_waiters();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn concurrent_identical_calls_execute_once() {
        let terminal = GatedStage::new(false);
        let results = run_concurrent(8, terminal.clone()).await;
        assert_eq!(terminal.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap().status(), 200);
        }
    }

    #[tokio::test]
    async fn leader_error_is_broadcast() {
        let terminal = GatedStage::new(true);
        let results = run_concurrent(4, terminal.clone()).await;
        assert_eq!(terminal.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Auth);
        }
    }

    #[tokio::test]
    async fn sequential_identical_calls_execute_separately() {
        let dedup = RequestDeduplicator::new();
        let terminal = GatedStage::new(false);
        let stages: Vec<Arc<dyn Stage>> = vec![terminal.clone()];

        for expected in 1..=2 {
            terminal.gate.notify_one();
            dedup
                .handle(&ctx(), &spec(), Next::new(&stages))
                .await
                .unwrap();
            assert_eq!(terminal.calls(), expected);
        }
        assert_eq!(dedup.inflight_count(), 0);
    }

    #[tokio::test]
    async fn different_fingerprints_run_independently() {
        let dedup = Arc::new(RequestDeduplicator::new());
        let terminal = GatedStage::new(false);

        let other = RequestSpec::get("https://api.example.com/v1/orders")
            .build()
            .unwrap();
        let a = {
            let dedup = dedup.clone();
            let terminal = terminal.clone();
            tokio::spawn(async move {
                let stages: Vec<Arc<dyn Stage>> = vec![terminal];
                dedup.handle(&ctx(), &spec(), Next::new(&stages)).await
            })
        };
        let b = {
            let dedup = dedup.clone();
            let terminal = terminal.clone();
            tokio::spawn(async move {
                let stages: Vec<Arc<dyn Stage>> = vec![terminal];
                dedup.handle(&ctx(), &other, Next::new(&stages)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Both executions are in flight simultaneously.
        assert_eq!(terminal.calls(), 2);
        assert_eq!(dedup.inflight_count(), 2);

        terminal.gate.notify_waiters();
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(dedup.inflight_count(), 0);
    }

    #[tokio::test]
    async fn follower_deadline_is_observed() {
        let dedup = Arc::new(RequestDeduplicator::new());
        let terminal = GatedStage::new(false);

        let leader = {
            let dedup = dedup.clone();
            let terminal = terminal.clone();
            tokio::spawn(async move {
                let stages: Vec<Arc<dyn Stage>> = vec![terminal];
                dedup.handle(&ctx(), &spec(), Next::new(&stages)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Follower with a tiny budget gives up while the leader hangs.
        let short = CallContext::new(Duration::from_millis(50), CancellationToken::new());
        let stages: Vec<Arc<dyn Stage>> = vec![terminal.clone()];
        let err = dedup
            .handle(&short, &spec(), Next::new(&stages))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(terminal.calls(), 1);

        terminal.gate.notify_waiters();
        leader.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_leader_promotes_a_follower() {
        let dedup = Arc::new(RequestDeduplicator::new());
        let terminal = GatedStage::new(false);

        let leader = {
            let dedup = dedup.clone();
            let terminal = terminal.clone();
            tokio::spawn(async move {
                let stages: Vec<Arc<dyn Stage>> = vec![terminal];
                dedup.handle(&ctx(), &spec(), Next::new(&stages)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let dedup = dedup.clone();
            let terminal = terminal.clone();
            tokio::spawn(async move {
                let stages: Vec<Arc<dyn Stage>> = vec![terminal];
                dedup.handle(&ctx(), &spec(), Next::new(&stages)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Abort the leader mid-flight; the follower re-registers and runs.
        leader.abort();
        assert!(leader.await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        terminal.gate.notify_waiters();
        follower.await.unwrap().unwrap();
        assert_eq!(terminal.calls(), 2);
    }
}
