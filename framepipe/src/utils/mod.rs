//! Supporting infrastructure: bit reading, error types and the output queue.

pub mod bitstream_io;
pub mod errors;
pub mod queue;
