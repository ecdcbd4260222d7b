//! Runtime system
//!
//! This module contains the task scheduler and its execution contexts.

pub mod scheduler;

pub use scheduler::{
    delay, yield_now, ConfigureAwait, Escalation, ExecutionContext, Handle, Scheduler, SchedulerConfig, TaskError,
    TaskHandle, TaskState, UnobservedFailure,
};
