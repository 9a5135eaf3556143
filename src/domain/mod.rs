//! The entity model (spec.md §3): workflows, handler runs, mutations,
//! topics/events, handler state, and sessions.

pub mod handler_run;
pub mod handler_state;
pub mod mutation;
pub mod script_run;
pub mod topic;
pub mod workflow;

pub use handler_run::{
    HandlerRun, HandlerStatus, HandlerType, IntendedMutation, MutationOutcome, Phase,
    PrepareResult, TopicReservation,
};
pub use handler_state::HandlerState;
pub use mutation::{Mutation, MutationStatus, ResolvedBy};
pub use script_run::{ScriptRun, SessionOutcome, TriggerKind};
pub use topic::{Event, EventStatus, Topic};
pub use workflow::{ConsumerConfig, HandlerConfig, ScheduleSpec, Workflow, WorkflowStatus};
