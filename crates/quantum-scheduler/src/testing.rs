//! Scripted executor for scheduler tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use quantum_core::{Error, Executor, PrNumber, Result};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    Pass,
    Fail,
    Error,
    Panic,
    Hang,
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedExecutor {
    script: HashMap<u64, Step>,
    delay: Duration,
    calls: Mutex<Vec<PrNumber>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    /// Passes every PR not otherwise scripted.
    pub(crate) fn passing() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, pr: u64, step: Step) -> Self {
        self.script.insert(pr, step);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> Vec<PrNumber> {
        self.calls.lock().unwrap().clone()
    }

    /// Most runs observed in flight at once.
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, pr: PrNumber) -> Result<bool> {
        self.calls.lock().unwrap().push(pr);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = self.script.get(&pr.get()).copied().unwrap_or(Step::Pass);
        let result = match step {
            Step::Pass => Ok(true),
            Step::Fail => Ok(false),
            Step::Error => Err(Error::ExecutionFailed("runner unreachable".into())),
            Step::Panic => panic!("executor blew up on PR {}", pr),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(true)
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
