use anyhow::Context;
use async_trait::async_trait;
use dialoguer::{theme::ColorfulTheme, Confirm};
use kvprobe_core::{Confirmer, TrialPrompt};

/// Asks on the terminal. Any prompt error (no TTY, Ctrl-C) stops the probe.
pub struct DialoguerConfirmer;

#[async_trait]
impl Confirmer for DialoguerConfirmer {
    async fn confirm(&self, prompt: &TrialPrompt) -> anyhow::Result<bool> {
        let message = prompt.message();
        tokio::task::spawn_blocking(move || {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(message)
                .default(true)
                .interact()
                .context("confirmation prompt failed")
        })
        .await
        .context("confirmation task panicked")?
    }
}
