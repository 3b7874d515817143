// Traffic engine implementations

pub mod memory;

pub use memory::{EngineOp, LimiterState, MemoryTrafficEngine};
