//! Periodic confirmation checkpoint for long-running probes.

use crate::session::AbortFlag;
use crate::sink::Channel;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Question put to the [`Confirmer`] at a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialPrompt {
    pub test_name: String,
    pub trial: u64,
}

impl TrialPrompt {
    pub fn message(&self) -> String {
        format!(
            "{} test has completed {} trials. Continue?",
            self.test_name, self.trial
        )
    }
}

/// External decision-maker consulted at checkpoints.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: &TrialPrompt) -> anyhow::Result<bool>;
}

/// Always answers "continue".
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysContinue;

#[async_trait]
impl Confirmer for AlwaysContinue {
    async fn confirm(&self, _prompt: &TrialPrompt) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Always answers "stop".
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverContinue;

#[async_trait]
impl Confirmer for NeverContinue {
    async fn confirm(&self, _prompt: &TrialPrompt) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Replays a fixed list of answers, then stops. Records every prompt.
#[derive(Debug, Default)]
pub struct ScriptedConfirmer {
    answers: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<TrialPrompt>>,
}

impl ScriptedConfirmer {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            prompts: Mutex::default(),
        }
    }

    pub fn prompts(&self) -> Vec<TrialPrompt> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn confirm(&self, prompt: &TrialPrompt) -> anyhow::Result<bool> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.clone());
        let answer = self
            .answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        answer.ok_or_else(|| anyhow::anyhow!("no scripted answer left for trial {}", prompt.trial))
    }
}

pub struct TrialGate {
    confirmer: Arc<dyn Confirmer>,
    pause: Duration,
}

impl TrialGate {
    pub const DEFAULT_PAUSE: Duration = Duration::from_millis(100);

    pub fn new(confirmer: Arc<dyn Confirmer>) -> Self {
        Self {
            confirmer,
            pause: Self::DEFAULT_PAUSE,
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn should_check(trial: u64, frequency: u64) -> bool {
        frequency > 0 && trial > 0 && trial % frequency == 0
    }

    /// Returns whether the probe should continue. An abort requested while
    /// the confirmer was deciding wins over a "continue" answer.
    pub async fn check_limit(
        &self,
        trial: u64,
        frequency: u64,
        test_name: &str,
        log: &Channel,
        abort: &AbortFlag,
    ) -> bool {
        if !Self::should_check(trial, frequency) {
            return true;
        }
        log.info(format!("--- {trial} trials completed, confirming ---"));
        tokio::time::sleep(self.pause).await;

        let prompt = TrialPrompt {
            test_name: test_name.to_string(),
            trial,
        };
        let answer = match self.confirmer.confirm(&prompt).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(trial, test = test_name, error = %e, "confirmation failed, stopping");
                false
            }
        };
        if answer && abort.is_requested() {
            tracing::debug!(trial, test = test_name, "abort requested during confirmation");
            return false;
        }
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{Destination, RecordingSink};

    fn gate(confirmer: Arc<dyn Confirmer>) -> TrialGate {
        TrialGate::new(confirmer).with_pause(Duration::ZERO)
    }

    #[test]
    fn only_exact_multiples_trigger() {
        assert!(!TrialGate::should_check(0, 10));
        assert!(!TrialGate::should_check(5, 10));
        assert!(TrialGate::should_check(20, 10));
        assert!(!TrialGate::should_check(20, 0));
    }

    #[tokio::test]
    async fn off_checkpoint_never_asks() {
        let sink = Arc::new(RecordingSink::new());
        let log = Channel::new(sink.clone(), Destination::Capacity);
        let confirmer = Arc::new(ScriptedConfirmer::new([]));
        let go_on = gate(confirmer.clone())
            .check_limit(7, 10, "Capacity", &log, &AbortFlag::new())
            .await;
        assert!(go_on);
        assert!(confirmer.prompts().is_empty());
        assert!(sink.messages(Destination::Capacity).is_empty());
    }

    #[tokio::test]
    async fn checkpoint_logs_and_returns_answer() {
        let sink = Arc::new(RecordingSink::new());
        let log = Channel::new(sink.clone(), Destination::Capacity);
        let confirmer = Arc::new(ScriptedConfirmer::new([true, false]));
        let gate = gate(confirmer.clone());
        let abort = AbortFlag::new();
        assert!(gate.check_limit(10, 10, "Capacity", &log, &abort).await);
        assert!(!gate.check_limit(20, 10, "Capacity", &log, &abort).await);
        assert!(sink.contains(Destination::Capacity, "--- 20 trials completed, confirming ---"));
        assert_eq!(confirmer.prompts()[1].trial, 20);
    }

    #[tokio::test]
    async fn confirmer_failure_means_stop() {
        let sink = Arc::new(RecordingSink::new());
        let log = Channel::new(sink, Destination::Count);
        let confirmer = Arc::new(ScriptedConfirmer::new([]));
        let go_on = gate(confirmer)
            .check_limit(3, 3, "Count", &log, &AbortFlag::new())
            .await;
        assert!(!go_on);
    }

    #[tokio::test]
    async fn pending_abort_overrides_continue() {
        let sink = Arc::new(RecordingSink::new());
        let log = Channel::new(sink, Destination::SingleSize);
        let confirmer = Arc::new(ScriptedConfirmer::new([true]));
        let abort = AbortFlag::new();
        abort.request();
        let go_on = gate(confirmer.clone())
            .check_limit(5, 5, "Single item size", &log, &abort)
            .await;
        assert!(!go_on);
        assert_eq!(confirmer.prompts().len(), 1);
    }
}
