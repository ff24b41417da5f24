#![allow(clippy::result_large_err)]
//! logtl Core
//!
//! A log-structured address translation layer. Client writes are appended to
//! a circular log on a cache device and mapped through a WRITE index; reads
//! are served from the log, from a READ index populated by a control plane,
//! or parked as faults until the control plane resolves them.
//!
//! # Architecture
//!
//! ```text
//!          write / read / flush
//!                  │
//! ┌────────────────▼────────────────┐
//! │           Translator            │
//! │  AdmissionController  Router    │
//! │  LogAllocator   ExtentIndex x2  │
//! │  FaultExchange                  │
//! └───────┬─────────────────┬───────┘
//!         │ log + read cache│ wait_for_* / resolve
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │ cache device  │ │ control plane │──► backend
//! └───────────────┘ └───────────────┘
//! ```

pub mod admission;
pub mod allocator;
pub mod control;
pub mod device;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod index;
pub mod journal;
pub mod router;
pub mod stats;

pub use admission::{Admission, AdmissionController, AdmissionStats};
pub use allocator::{Allocation, LogAllocator, TrimRange, WrapMarker};
pub use control::{Backend, ControlPlane, ControlSummary, FileBackend, NullBackend, ReadCacheRegion};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use engine::{MapPage, PendingIo, Translator};
pub use error::{BlockError, BlockResult};
pub use exchange::{FaultExchange, FaultRange, QueueDepths, WriteRecord};
pub use index::{ExtentIndex, ExtentPool, IndexMap};
pub use journal::{HeaderExtent, JournalHeader};
pub use router::ReadSegment;
pub use stats::{EngineStats, IoSnapshot};
