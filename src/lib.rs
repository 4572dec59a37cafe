// Runtime-agnostic pieces live in chatify-core; re-exported here for convenience
pub use chatify_core::{candidates, clock, phase, signaling};

pub mod types {
    pub use chatify_core::types::*;
}

// Async call runtime: relay, transport, media and session supervision
pub mod calls;
