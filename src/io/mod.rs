//! Dataset input for the command-line runner.

pub mod sequence;

pub use sequence::MonoSequence;
