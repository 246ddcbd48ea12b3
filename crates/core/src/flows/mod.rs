pub mod engine;
pub mod states;

pub use engine::RequestStateMachine;
pub use states::{
    ActionCommand, CreationPlan, PendingLevel, RecordWrite, RequestDraft, TransitionKind,
    TransitionPlan,
};
