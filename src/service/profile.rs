// Profile regeneration: fold unincorporated contributions (and the prior
// profile) into a fresh profile document. Version monotonicity is enforced
// by the store — when two regenerations race, exactly one commits.

use std::sync::LazyLock;

use log::{info, warn};
use regex::Regex;

use super::MemoryService;
use crate::atoms::error::{MemoryError, MemoryResult, StorageError};
use crate::tokenizer::{count_tokens, truncate_to_budget};

pub const PROFILE_SYSTEM_PROMPT: &str = "\
You maintain a concise profile of the user for a personal AI assistant.\n\
Rewrite the profile to incorporate the new facts below.\n\
Rules:\n\
- Only state what the facts and the existing profile establish. Never invent.\n\
- No preamble, no closing remarks, no placeholders like [name].\n\
- Keep the user's own overrides verbatim where given.\n\
- Plain prose or short bullet lines; no headings.";

static PREAMBLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:certainly|sure|of course|okay|alright)[!,.]?\s+|here(?:'s| is)\b[^:\n]*:\s*)",
    )
    .expect("preamble regex")
});

/// Strip the common assistant preambles ("Certainly!", "Here is …:") that
/// small models prepend despite instructions.
pub fn strip_preamble(text: &str) -> String {
    let mut out = text.trim().to_string();
    loop {
        let stripped = PREAMBLE_RE.replace(&out, "").into_owned();
        if stripped == out {
            break;
        }
        out = stripped;
    }
    out.trim().to_string()
}

impl MemoryService {
    /// Rebuild the global profile from the current profile, the open
    /// contributions, and the user's own edits. Fire-and-forget from the
    /// extraction path; safe to run concurrently (one version commits).
    pub async fn regenerate_profile(&self) -> MemoryResult<()> {
        let _guard = self.op_lock.lock().await;
        let started = std::time::Instant::now();

        let contributions = self.store.unincorporated_contributions()?;
        if contributions.is_empty() {
            return Ok(());
        }
        let current = self.store.get_profile()?;
        let edits = self.store.active_user_edits()?;

        let mut prompt = String::new();
        if let Some(profile) = &current {
            prompt.push_str("Current profile:\n");
            prompt.push_str(&profile.content);
            prompt.push_str("\n\n");
        }
        if !edits.is_empty() {
            prompt.push_str("User overrides (keep verbatim):\n");
            for edit in &edits {
                prompt.push_str(&format!("- {}\n", edit.content));
            }
            prompt.push('\n');
        }
        prompt.push_str("New facts:\n");
        for contribution in &contributions {
            prompt.push_str(&format!("- {}\n", contribution.content));
        }

        let response = match self
            .call_core_model("profile_regeneration", PROFILE_SYSTEM_PROMPT, prompt)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.store
                    .log_processing(
                        "",
                        "profile_regeneration",
                        Some(&self.config.core_model_name),
                        "error",
                        Some(&e.to_string()),
                        0,
                        0,
                        started.elapsed().as_millis() as i64,
                    )
                    .await?;
                return Err(e);
            }
        };

        let content = strip_preamble(&response.text);
        if content.is_empty() {
            warn!("[memory] Profile regeneration produced empty content — keeping current profile");
            return Ok(());
        }
        let content =
            truncate_to_budget(&content, self.config.profile_max_tokens as usize).to_string();
        let token_count = count_tokens(&content) as i64;

        match self
            .store
            .replace_profile(&content, token_count, &self.config.core_model_name)
            .await
        {
            Ok(version) => {
                info!(
                    "[memory] Profile regenerated: v{} ({} tokens, {} contributions absorbed)",
                    version,
                    token_count,
                    contributions.len()
                );
                self.store
                    .log_processing(
                        "",
                        "profile_regeneration",
                        Some(&self.config.core_model_name),
                        "success",
                        Some(&format!("v{}", version)),
                        response.input_tokens,
                        response.output_tokens,
                        started.elapsed().as_millis() as i64,
                    )
                    .await?;
                Ok(())
            }
            Err(StorageError::Conflict(_)) => {
                // A concurrent regeneration won; this one yields.
                info!("[memory] Profile regeneration lost the version race — discarding");
                Ok(())
            }
            Err(e) => Err(MemoryError::Storage(e)),
        }
    }
}
