//! Typed interfaces to everything spec.md §1 puts out of scope: the UI, the
//! OAuth/credential store, concrete tool APIs, the sandbox VM that runs
//! handler code, and the pieces of the replicated store this crate doesn't
//! own. The engine programs against these traits only; no concrete
//! implementation of any of them ships here except test doubles.

pub mod classifier;
pub mod connection;
pub mod sandbox;
pub mod tool;

pub use classifier::ErrorClassifier;
pub use connection::{Connection, ConnectionManager, ConnectionStatus};
pub use sandbox::{ConsumerStep, Sandbox, SandboxError};
pub use tool::{Tool, ToolRegistry};
