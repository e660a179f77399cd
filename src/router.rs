use crate::types::ProcessingMode;

/// Chooses `full_read` vs `fallback` processing for a document by comparing
/// its total token count against the configured generator context budget (§4.9).
pub struct ScenarioRouter {
    full_read_budget_tokens: usize,
}

impl ScenarioRouter {
    pub fn new(full_read_budget_tokens: usize) -> Self {
        Self { full_read_budget_tokens }
    }

    pub fn route(&self, total_tokens: usize) -> ProcessingMode {
        if total_tokens <= self.full_read_budget_tokens {
            ProcessingMode::FullRead
        } else {
            ProcessingMode::Fallback
        }
    }
}
