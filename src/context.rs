//! Operator context threaded through entity-creation calls.

use serde::{Deserialize, Serialize};

/// Who is operating which terminal, and under which shift.
///
/// Supplied by the session layer; nothing in the core looks these up
/// globally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorContext {
    pub terminal_id: String,
    pub operator_id: Option<String>,
    pub shift_id: Option<String>,
}

impl OperatorContext {
    pub fn new(terminal_id: impl Into<String>) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            operator_id: None,
            shift_id: None,
        }
    }

    pub fn with_operator(mut self, operator_id: impl Into<String>) -> Self {
        self.operator_id = Some(operator_id.into());
        self
    }

    pub fn with_shift(mut self, shift_id: impl Into<String>) -> Self {
        self.shift_id = Some(shift_id.into());
        self
    }
}
