//! Application glue for the part-counting pipeline: the processing loop,
//! its event vocabulary, and synthetic test movies.

mod events;
mod processor;
pub mod synth;

pub use events::PipelineEvent;
pub use processor::{Processor, ProcessorCommand, ProcessorHandle};
