//! Zero-copy flow capture on Linux.
//!
//! A TPACKET_V3 ring delivers frames in place, each tagged with its IPv4
//! 5-tuple, while an XDP program (or a user-space fallback) accounts per-flow
//! packet and byte counts.

pub mod capture;
pub mod config;
pub mod error;
pub mod extract;
pub mod flow_table;
pub mod model;
pub mod ring;
pub mod session;
pub mod store;

pub use capture::{CaptureStats, CapturedFrame, FlowCapture, Polled};
pub use config::{CaptureConfig, ConfigError};
pub use error::{CaptureError, FlowTableError};
pub use extract::{SkipReason, extract};
pub use flow_table::{FlowTable, FlowTableConfig, FlowTableMode, KernelFlowTable, XdpMode};
pub use model::{FlowRecord, FlowTableCounters, L7Protocol};
pub use ring::{Block, Frame, Frames, RingGeometry};
pub use session::{CaptureSession, KernelStats, NextBlock, SessionOptions, StopHandle};
pub use store::BoundedFlowTable;

pub use flowtap_common::{FlowKey, FlowStats};
