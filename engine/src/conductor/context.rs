//! Context Assembler
//!
//! Packs similar past runs into the prompts of the planning and generation
//! agents. Retrieved records are advisory: an empty context is always valid.

use sdk::types::ScoredRecord;

/// How much past context a prompt may carry
#[derive(Debug, Clone)]
pub struct ContextBudget {
    /// Successful past artifacts to include
    pub max_examples: usize,
    /// Characters kept from each past artifact
    pub artifact_chars: usize,
    /// Past failures to mention
    pub max_failures: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_examples: 2,
            artifact_chars: 500,
            max_failures: 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    budget: ContextBudget,
}

impl ContextAssembler {
    pub fn new(budget: ContextBudget) -> Self {
        Self { budget }
    }

    /// Render the records as a prompt section, or an empty string
    ///
    /// Records are expected in rank order (best match first).
    pub fn assemble(&self, records: &[ScoredRecord]) -> String {
        let mut section = String::new();

        let successes: Vec<&ScoredRecord> = records
            .iter()
            .filter(|r| r.record.passed() == Some(true) && r.record.artifact.is_some())
            .take(self.budget.max_examples)
            .collect();

        if !successes.is_empty() {
            section.push_str("\n\n--- Relevant Past Tasks ---\n");
            for scored in successes {
                let Some(artifact) = scored.record.artifact.as_ref() else {
                    continue;
                };
                section.push_str(&format!(
                    "Task: {} (similarity {:.2})\nPlaybook that worked:\n{}\n\n",
                    scored.record.request_text,
                    scored.score,
                    truncate_chars(&artifact.content, self.budget.artifact_chars)
                ));
            }
        }

        let failures: Vec<&ScoredRecord> = records
            .iter()
            .filter(|r| r.record.verdict.as_ref().is_some_and(|v| !v.passed))
            .take(self.budget.max_failures)
            .collect();

        if !failures.is_empty() {
            section.push_str("\n--- Past Failures To Avoid ---\n");
            for scored in failures {
                let summary = scored
                    .record
                    .verdict
                    .as_ref()
                    .map(|v| v.summary.as_str())
                    .unwrap_or_default();
                section.push_str(&format!(
                    "Task: {}\nOutcome: {}\n",
                    scored.record.request_text,
                    truncate_chars(summary, 200)
                ));
            }
        }

        section
    }
}

/// Keep at most `max` characters, marking the cut
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}\n# ...truncated", &text[..cut]),
        None => text.to_string(),
    }
}
