pub mod chunker;
pub mod extract;
pub mod pipeline;
pub mod queue;
pub mod tasks;
