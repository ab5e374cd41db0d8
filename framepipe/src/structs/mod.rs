//! Frame descriptions, pooled surfaces and the RAWV stream format.

pub mod frame;
pub mod rawv;
pub mod surface;
