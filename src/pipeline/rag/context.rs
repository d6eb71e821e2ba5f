use super::prompt::{
    knowledge_line, metric_line, rendered_section_len, render_section, KNOWLEDGE_TAG,
    REPORT_EXCERPT_CHARS, REPORT_TAG, SYSTEM_INSTRUCTIONS,
};
use super::types::{PromptContext, PromptMessage, PromptRole, RetrievalResult};
use crate::models::enums::TurnRole;
use crate::models::{Document, Turn};
use crate::pipeline::safety::truncate_at_word_boundary;

/// An excerpt shorter than this is not worth the section header.
const MIN_EXCERPT_CHARS: usize = 40;

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Lines accumulated under one tag, admitted only while the rendered
/// section still fits.
struct Section {
    tag: &'static str,
    body: String,
    body_chars: usize,
}

impl Section {
    fn new(tag: &'static str) -> Self {
        Self {
            tag,
            body: String::new(),
            body_chars: 0,
        }
    }

    fn chars_with(&self, line: &str) -> usize {
        let sep = usize::from(!self.body.is_empty());
        rendered_section_len(self.tag, self.body_chars + sep + char_len(line))
    }

    fn try_push(&mut self, line: &str, limit: usize) -> bool {
        if self.chars_with(line) > limit {
            return false;
        }
        if !self.body.is_empty() {
            self.body.push('\n');
            self.body_chars += 1;
        }
        self.body.push_str(line);
        self.body_chars += char_len(line);
        true
    }

    fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    fn rendered_len(&self) -> usize {
        rendered_section_len(self.tag, self.body_chars)
    }

    fn render(&self) -> String {
        render_section(self.tag, &self.body)
    }
}

/// Builds the bounded prompt for one chat turn.
///
/// The query is reserved first and always kept whole. The rest of the char
/// budget goes, in priority order, to the system instructions, the newest
/// history turns, the active report and the retrieved knowledge. Turns and
/// knowledge snippets are included whole or not at all.
pub struct ContextAssembler {
    char_budget: usize,
    history_turns: usize,
    instructions: String,
}

impl ContextAssembler {
    pub fn new(char_budget: usize, history_turns: usize) -> Self {
        Self {
            char_budget,
            history_turns,
            instructions: SYSTEM_INSTRUCTIONS.to_string(),
        }
    }

    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = instructions.to_string();
        self
    }

    pub fn assemble(
        &self,
        retrieval: &RetrievalResult,
        report: Option<&Document>,
        history: &[Turn],
        query: &str,
    ) -> PromptContext {
        let mut remaining = self.char_budget.saturating_sub(char_len(query));

        let instructions_truncated = char_len(&self.instructions) > remaining;
        let mut system = if instructions_truncated {
            truncate_at_word_boundary(&self.instructions, remaining)
        } else {
            self.instructions.clone()
        };
        remaining -= char_len(&system);

        let mut kept_turns = Vec::new();
        for turn in history.iter().rev().take(self.history_turns) {
            let len = char_len(&turn.content);
            if len > remaining {
                break;
            }
            remaining -= len;
            kept_turns.push(turn);
        }
        kept_turns.reverse();

        let mut metrics_included = 0;
        if let Some(doc) = report {
            let mut section = Section::new(REPORT_TAG);
            for (key, value) in &doc.metrics {
                if !section.try_push(&metric_line(key, value), remaining) {
                    break;
                }
                metrics_included += 1;
            }
            if let Some(raw) = doc.raw_text.as_deref().filter(|t| !t.trim().is_empty()) {
                let header = "Excerpt:";
                let fixed = section.chars_with(header) + 1;
                let room = remaining.saturating_sub(fixed).min(REPORT_EXCERPT_CHARS);
                if room >= MIN_EXCERPT_CHARS {
                    let excerpt = truncate_at_word_boundary(raw, room);
                    if !excerpt.is_empty() {
                        section.try_push(&format!("{header}\n{excerpt}"), remaining);
                    }
                }
            }
            if !section.is_empty() {
                remaining -= section.rendered_len();
                system.push_str(&section.render());
            }
        }

        let mut knowledge_included = 0;
        let mut section = Section::new(KNOWLEDGE_TAG);
        for (rank, scored) in retrieval.chunks.iter().enumerate() {
            // Lowest-similarity snippets come last and are the first to go.
            if !section.try_push(&knowledge_line(rank + 1, &scored.chunk.text), remaining) {
                break;
            }
            knowledge_included += 1;
        }
        if !section.is_empty() {
            system.push_str(&section.render());
        }

        let mut messages = Vec::with_capacity(kept_turns.len() + 2);
        messages.push(PromptMessage::new(PromptRole::System, system));
        for turn in &kept_turns {
            let role = match turn.role {
                TurnRole::User => PromptRole::User,
                TurnRole::Assistant => PromptRole::Assistant,
            };
            messages.push(PromptMessage::new(role, turn.content.clone()));
        }
        messages.push(PromptMessage::new(PromptRole::User, query));

        let total_chars = messages.iter().map(PromptMessage::char_len).sum();
        tracing::debug!(
            total_chars,
            budget = self.char_budget,
            history = kept_turns.len(),
            metrics = metrics_included,
            knowledge = knowledge_included,
            "Prompt context assembled"
        );

        PromptContext {
            messages,
            total_chars,
            budget: self.char_budget,
            instructions_truncated,
            history_turns: kept_turns.len(),
            metrics_included,
            knowledge_included,
        }
    }
}
