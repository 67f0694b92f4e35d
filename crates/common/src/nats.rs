mod client;
mod message;
mod trace_context;
mod traits;

pub use client::*;
pub use message::*;
pub use trace_context::*;
pub use traits::*;
