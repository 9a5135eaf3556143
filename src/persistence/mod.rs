//! Persistence façade (spec.md §4.1): the `EngineStore` trait plus its two
//! concrete backings.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryEngineStore;
pub use postgres::PostgresEngineStore;
pub use store::{EngineStore, NewEvent, PeekFilter, ReservationRequest, StoreError};
