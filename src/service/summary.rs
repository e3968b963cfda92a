// Conversation summaries: generated from the conversation's pending signals
// when a session goes idle (debounce) or the active session changes.
// Inserting the summary and flipping the signals to processed is one store
// transaction; on any failure the signals stay pending for the next trigger.

use log::{info, warn};

use super::{profile::strip_preamble, MemoryService};
use crate::atoms::error::MemoryResult;
use crate::atoms::types::{ConversationSummary, EmbeddingSource, EntryStatus};
use crate::tokenizer::count_tokens;

pub const SUMMARY_SYSTEM_PROMPT: &str = "\
You summarize one conversation between a user and an assistant.\n\
Write 2-5 sentences covering what the user wanted, what was decided or\n\
produced, and any follow-ups. No preamble, no bullet points, no headings.";

impl MemoryService {
    /// Summarize a conversation's pending signals. A conversation with no
    /// pending signals is a no-op.
    pub async fn generate_conversation_summary(
        &self,
        agent_id: &str,
        conversation_id: &str,
    ) -> MemoryResult<()> {
        let _guard = self.op_lock.lock().await;
        let started = std::time::Instant::now();

        let signals = self.store.pending_signals_for(conversation_id)?;
        if signals.is_empty() {
            return Ok(());
        }

        let mut transcript = String::new();
        for signal in &signals {
            transcript.push_str(&format!("User: {}\n", signal.user_message));
            if let Some(assistant) = &signal.assistant_message {
                transcript.push_str(&format!("Assistant: {}\n", assistant));
            }
        }

        let response = match self
            .call_core_model("summary", SUMMARY_SYSTEM_PROMPT, transcript)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "[memory] Summary for {} failed (signals stay pending): {}",
                    conversation_id, e
                );
                self.store
                    .log_processing(
                        agent_id,
                        "summary",
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

        let text = strip_preamble(&response.text);
        if text.is_empty() {
            warn!(
                "[memory] Empty summary for {} — signals stay pending",
                conversation_id
            );
            return Ok(());
        }

        let conversation_at = signals
            .last()
            .map(|s| s.created_at.clone())
            .unwrap_or_else(crate::store::now_iso);
        let summary = ConversationSummary {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            conversation_id: conversation_id.to_string(),
            token_count: count_tokens(&text) as i64,
            summary: text,
            model: self.config.core_model_name.clone(),
            conversation_at,
            status: EntryStatus::Active,
            created_at: crate::store::now_iso(),
        };

        self.store
            .insert_summary_and_mark_processed(&summary)
            .await?;
        self.search
            .index_document(EmbeddingSource::Summary, &summary.id, &summary.summary)
            .await?;

        info!(
            "[memory] Summarized {} ({} signals, {} tokens)",
            conversation_id,
            signals.len(),
            summary.token_count
        );
        self.store
            .log_processing(
                agent_id,
                "summary",
                Some(&self.config.core_model_name),
                "success",
                None,
                response.input_tokens,
                response.output_tokens,
                started.elapsed().as_millis() as i64,
            )
            .await?;
        Ok(())
    }

    /// Startup recovery: summarize every conversation that still has
    /// pending signals, sequentially. Failures leave their signals in
    /// place and do not block the rest of the worklist.
    pub async fn recover_orphaned_signals(&self) -> MemoryResult<usize> {
        let pairs = self.store.conversations_with_pending_signals()?;
        if pairs.is_empty() {
            return Ok(0);
        }
        info!(
            "[memory] Recovering {} conversations with orphaned signals",
            pairs.len()
        );
        let mut recovered = 0usize;
        for (agent_id, conversation_id) in pairs {
            match self
                .generate_conversation_summary(&agent_id, &conversation_id)
                .await
            {
                Ok(()) => recovered += 1,
                Err(e) => warn!(
                    "[memory] Orphan recovery failed for {}: {}",
                    conversation_id, e
                ),
            }
        }
        Ok(recovered)
    }
}
