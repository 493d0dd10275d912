//! Scripted probe implementations.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;
use url::Url;

use crate::endpoint::EndpointProbe;
use crate::error::{Error, Result};

/// What a scripted probe does for one call.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// Complete immediately.
    Succeed,
    /// Complete after the given (virtual) delay; drives latency
    /// measurements deterministically.
    SucceedAfter(Duration),
    /// Fail with a connection reset.
    Fail,
    /// Never complete within any reasonable timeout.
    Hang,
}

/// An [`EndpointProbe`] driven by per-URL scripts.
///
/// One-shot outcomes pushed with [`push`](Self::push) are consumed first;
/// otherwise the steady outcome set with [`set`](Self::set) applies, then
/// the constructor default. Calls are counted per URL.
pub struct ScriptedProbe {
    default: ProbeOutcome,
    steady: Mutex<HashMap<String, ProbeOutcome>>,
    queued: Mutex<HashMap<String, VecDeque<ProbeOutcome>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedProbe {
    pub fn new(default: ProbeOutcome) -> Self {
        Self {
            default,
            steady: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Every unscripted call succeeds.
    pub fn always_ok() -> Self {
        Self::new(ProbeOutcome::Succeed)
    }

    /// Every unscripted call fails.
    pub fn always_failing() -> Self {
        Self::new(ProbeOutcome::Fail)
    }

    /// Set the steady outcome for a URL (applies until changed).
    pub fn set(&self, url: &str, outcome: ProbeOutcome) {
        self.steady.lock().insert(url.to_string(), outcome);
    }

    /// Queue a one-shot outcome for a URL, consumed before the steady one.
    pub fn push(&self, url: &str, outcome: ProbeOutcome) {
        self.queued
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Number of probe calls seen for a URL.
    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EndpointProbe for ScriptedProbe {
    async fn check(&self, url: &Url) -> Result<()> {
        let key = url.as_str().to_string();
        *self.calls.lock().entry(key.clone()).or_insert(0) += 1;

        let outcome = {
            let mut queued = self.queued.lock();
            match queued.get_mut(&key).and_then(VecDeque::pop_front) {
                Some(outcome) => outcome,
                None => self
                    .steady
                    .lock()
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| self.default.clone()),
            }
        };

        match outcome {
            ProbeOutcome::Succeed => Ok(()),
            ProbeOutcome::SucceedAfter(delay) => {
                sleep(delay).await;
                Ok(())
            }
            ProbeOutcome::Fail => Err(Error::connection_reset(format!(
                "scripted failure for {key}"
            ))),
            ProbeOutcome::Hang => {
                sleep(Duration::from_secs(3_600)).await;
                Err(Error::timeout(format!("scripted hang for {key}")))
            }
        }
    }
}
