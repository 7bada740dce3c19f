//! Lifecycle Bus
//!
//! Named coordination points of a run. Handlers registered for a phase run
//! one at a time in registration order; a phase completes only when every
//! handler has settled.
//!
//! ```text
//! beforeLoadTests -> beforeTests -> beforeEachTest* -> cleanup
//!          phaseStart / phaseEnd bracket groups anywhere
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{panic_message, LifecycleError};

/// A lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    BeforeLoadTests,
    BeforeTests,
    BeforeEachTest,
    Cleanup,
    PhaseStart,
    PhaseEnd,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::BeforeLoadTests => "beforeLoadTests",
            Phase::BeforeTests => "beforeTests",
            Phase::BeforeEachTest => "beforeEachTest",
            Phase::Cleanup => "cleanup",
            Phase::PhaseStart => "phaseStart",
            Phase::PhaseEnd => "phaseEnd",
        }
    }

    /// Position in the fixed run order; bracketing phases are unordered
    fn order(&self) -> Option<u8> {
        match self {
            Phase::BeforeLoadTests => Some(0),
            Phase::BeforeTests => Some(1),
            Phase::BeforeEachTest => Some(2),
            Phase::Cleanup => Some(3),
            Phase::PhaseStart | Phase::PhaseEnd => None,
        }
    }

    /// Whether the phase may fire at most once per run
    pub fn is_singular(&self) -> bool {
        matches!(self, Phase::BeforeLoadTests | Phase::BeforeTests | Phase::Cleanup)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Argument passed to every handler of a triggered phase
#[derive(Debug, Clone)]
pub struct PhaseEvent {
    pub phase: Phase,
    /// Test full title for `beforeEachTest`, group name for `phaseStart`/`phaseEnd`
    pub subject: Option<String>,
}

pub type PhaseHandler =
    Arc<dyn Fn(PhaseEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
struct Progress {
    latest: Option<Phase>,
    triggered: HashSet<Phase>,
}

#[derive(Default)]
struct BusInner {
    handlers: Mutex<HashMap<Phase, Vec<PhaseHandler>>>,
    progress: Mutex<Progress>,
}

/// Phase dispatcher shared by the runner, the registry and every capability object
#[derive(Clone, Default)]
pub struct LifecycleBus {
    inner: Arc<BusInner>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `phase`
    pub fn on<F, Fut>(&self, phase: Phase, handler: F)
    where
        F: Fn(PhaseEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if phase.is_singular() && self.has_triggered(phase) {
            warn!("Handler registered for {} after it already fired; it will not run", phase);
        }

        let handler: PhaseHandler = Arc::new(move |event| handler(event).boxed());
        self.inner
            .handlers
            .lock()
            .entry(phase)
            .or_default()
            .push(handler);
    }

    pub fn handler_count(&self, phase: Phase) -> usize {
        self.inner.handlers.lock().get(&phase).map_or(0, Vec::len)
    }

    pub fn has_triggered(&self, phase: Phase) -> bool {
        self.inner.progress.lock().triggered.contains(&phase)
    }

    /// Run every handler of `phase` sequentially.
    ///
    /// The first failing handler ends the phase, except for `cleanup`,
    /// where every handler runs and failures are collected.
    pub async fn trigger(&self, phase: Phase, subject: Option<String>) -> Result<(), LifecycleError> {
        self.admit(phase)?;

        let handlers = self
            .inner
            .handlers
            .lock()
            .get(&phase)
            .cloned()
            .unwrap_or_default();

        debug!(phase = %phase, subject = ?subject, handlers = handlers.len(), "Triggering lifecycle phase");

        let event = PhaseEvent { phase, subject };

        if phase == Phase::Cleanup {
            let mut failures = Vec::new();
            for (index, handler) in handlers.iter().enumerate() {
                if let Err(e) = run_handler(handler, event.clone()).await {
                    error!("cleanup handler #{} failed: {:#}", index, e);
                    failures.push(e);
                }
            }
            if failures.is_empty() {
                return Ok(());
            }
            return Err(LifecycleError::Cleanup { failures });
        }

        for (index, handler) in handlers.iter().enumerate() {
            if let Err(source) = run_handler(handler, event.clone()).await {
                return Err(LifecycleError::Phase {
                    phase,
                    index,
                    source,
                });
            }
        }

        Ok(())
    }

    /// Bracket `work` with `phaseStart`/`phaseEnd` for `group`.
    /// `phaseEnd` fires even when `work` fails.
    pub async fn bracket<T, E, Fut>(&self, group: &str, work: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: From<LifecycleError>,
    {
        self.trigger(Phase::PhaseStart, Some(group.to_string())).await?;
        let result = work.await;
        let end = self.trigger(Phase::PhaseEnd, Some(group.to_string())).await;
        match (result, end) {
            (Ok(value), end) => {
                end?;
                Ok(value)
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(end_err)) => {
                warn!("phaseEnd for '{}' also failed: {}", group, end_err);
                Err(err)
            }
        }
    }

    fn admit(&self, phase: Phase) -> Result<(), LifecycleError> {
        let mut progress = self.inner.progress.lock();

        if let Some(order) = phase.order() {
            if phase.is_singular() && progress.triggered.contains(&phase) {
                return Err(LifecycleError::AlreadyTriggered { phase });
            }
            if let Some(latest) = progress.latest {
                if latest.order().unwrap_or(0) > order {
                    return Err(LifecycleError::OutOfOrder {
                        phase,
                        after: latest,
                    });
                }
            }
            progress.latest = Some(phase);
        }

        progress.triggered.insert(phase);
        Ok(())
    }
}

impl fmt::Debug for LifecycleBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.inner.handlers.lock();
        let mut counts: Vec<(&str, usize)> = handlers.iter().map(|(p, h)| (p.as_str(), h.len())).collect();
        counts.sort();
        f.debug_struct("LifecycleBus").field("handlers", &counts).finish()
    }
}

async fn run_handler(handler: &PhaseHandler, event: PhaseEvent) -> anyhow::Result<()> {
    let handler = handler.clone();
    match AssertUnwindSafe(async move { handler(event).await }).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "handler panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}
