//! Durable flows: the runtime contract, the in-process engine, and the
//! shipped dev flows.

mod dev;
mod engine;
mod runtime;

pub use dev::FlowInput;
pub use engine::{FlowEngine, FlowSnapshot, SignalHub};
pub use runtime::{
    ActivityCtx, ActivityError, ActivityOptions, FlowCtx, FlowError, FlowEvent, RetryPolicy,
    action_channel,
};
