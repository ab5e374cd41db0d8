//! Surface lifecycle and concurrency core of a two-stage video pipeline.
//!
//! A decode stage produces raw frames, a video post-processing (VPP) stage
//! resizes and colour converts them, and matched (decoded, processed) pairs
//! reach the consumer through a bounded queue. Surfaces stay owned by their
//! pools; consumers hold reservations through handles that release on drop,
//! and the reservation budget is what throttles the producer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use framepipe::device::{Device, Implementation};
//! use framepipe::process::pipeline::{Pipeline, PipelineConfig};
//! use framepipe::process::soft::SoftSessionFactory;
//!
//! let device = Device::open(Implementation::Software);
//! let mut pipeline = Pipeline::new(
//!     device.clone(),
//!     Arc::new(SoftSessionFactory::default()),
//!     PipelineConfig::default(),
//! );
//!
//! pipeline.start("input.rawv", Implementation::Software, false)?;
//! while let Some(pair) = pipeline.get() {
//!     let bytes = pair.processed.with_data(|data| data.len())?;
//!     println!("frame {}: {bytes} bytes", pair.processed.frame_number());
//! }
//! pipeline.stop()?;
//! device.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Frame allocators and the memory-type dispatch table.
///
/// - **System memory** ([`alloc::system`]): plain heap buffers
/// - **Device memory** ([`alloc::device`]): buffers reachable by the CPU only
///   through a staging copy while locked
pub mod alloc;

/// Process-wide device handle shared by every pipeline.
pub mod device;

/// Pipeline stages, surface pools and the pipeline itself.
///
/// 1. **Pools** ([`process::pool`]): surfaces plus reservation budget
/// 2. **Stages** ([`process::stage`]): decode, VPP and sync contracts
/// 3. **Pipeline** ([`process::pipeline`]): thread lifecycle and output
pub mod process;

/// Frame descriptions, surfaces and the RAWV stream format.
pub mod structs;

/// Bit reading, error types and the blocking queue.
pub mod utils;
