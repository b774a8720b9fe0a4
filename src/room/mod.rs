//! Relay-side room membership.

pub mod registry;
pub mod state;

pub use registry::{Delivery, JoinOutcome, RelayRegistry};
pub use state::{Outbox, Participant, RoomState};
