//! The orchestration core: a session state machine enforcing the
//! PLAN → EXECUTE → REVIEW workflow, a per-turn reasoning loop with
//! mode-aware tool filtering and provider failover, and a delegation engine
//! running the Developer↔Reviewer handoff cycle.

mod delegation;
mod events;
mod history;
mod logger;
mod prompts;
mod session;
mod trajectory;
mod turn;
#[cfg(test)]
mod tests;

pub use delegation::{
    contains_placeholder, DelegationPhase, PLACEHOLDER_PHRASES, PLACEHOLDER_REJECTION,
};
pub use events::{EventKind, SessionEvent};
pub use history::prune;
pub use logger::SessionLogger;
pub use prompts::{detect_text_question, is_approval, mode_banner, APPROVAL_WORDS};
pub use session::{
    Session, SessionMode, TaskResult, TaskSpec, TaskStatus, ToolServer, CONTROL_TOOLS,
    READ_ONLY_TOOLS, WRITE_TOOLS,
};
pub use trajectory::{TrajectoryLogger, TrajectoryStep};
pub use turn::TurnOutcome;
