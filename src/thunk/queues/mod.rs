pub mod builder;

pub use builder::{EngineQueue, QueueBuilder, QueueInterface};
