// State machine module for backup orchestration
//
// Operation states for the operation table and pass lifecycle tracking for
// backup, restore and maintenance passes.

pub mod events;
pub mod pass_state_machine;
pub mod states;

pub use events::PassEvent;
pub use pass_state_machine::{PassStateMachine, PassTransition};
pub use states::{OperationState, OperationType, PassKind, PassState};
