pub mod candidates;
pub mod clock;
pub mod phase;
pub mod signaling;
pub mod types;
