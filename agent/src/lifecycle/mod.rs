pub mod client;
pub mod orchestrate;

pub use client::{LifecycleClient, LifecycleError, QueryResponse, WakeResponse};
pub use orchestrate::run;
