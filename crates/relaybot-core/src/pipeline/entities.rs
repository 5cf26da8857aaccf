//! Stage result types.

use relaybot_types::message::MessageChain;

/// Control signal a stage returns to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    /// Proceed to the next stage.
    Continue,
    /// Stop processing; only the response stage may still run when a
    /// user notice is attached.
    Interrupt,
}

/// Outcome of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageProcessResult {
    pub result_type: ResultType,
    /// Chain to deliver to the user on interrupt.
    pub user_notice: Option<MessageChain>,
    /// Error description recorded against the query.
    pub error: Option<String>,
    /// Operator-facing note, logged only.
    pub console_notice: Option<String>,
}

impl StageProcessResult {
    pub fn cont() -> Self {
        Self {
            result_type: ResultType::Continue,
            user_notice: None,
            error: None,
            console_notice: None,
        }
    }

    pub fn interrupt() -> Self {
        Self {
            result_type: ResultType::Interrupt,
            user_notice: None,
            error: None,
            console_notice: None,
        }
    }

    pub fn interrupt_with_notice(notice: MessageChain) -> Self {
        Self {
            result_type: ResultType::Interrupt,
            user_notice: Some(notice),
            error: None,
            console_notice: None,
        }
    }

    pub fn with_console_notice(mut self, notice: impl Into<String>) -> Self {
        self.console_notice = Some(notice.into());
        self
    }
}
