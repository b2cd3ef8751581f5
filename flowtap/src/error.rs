//! Error types for the capture path and the flow table.

use std::io;

use thiserror::Error;

/// Errors surfaced by the capture session and the host boundary.
///
/// Idle timeouts and skipped frames are not errors and never show up here.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Raw sockets (or BPF) need CAP_NET_RAW / CAP_BPF or root.
    #[error("{op} on {interface} denied: missing CAP_NET_RAW or root")]
    PermissionDenied {
        interface: String,
        op: &'static str,
    },

    #[error("interface {interface} not found")]
    InterfaceNotFound { interface: String },

    /// The kernel refused the ring request or the mapping failed.
    #[error("ring setup on {interface} failed at {op}: {source}")]
    RingSetupFailed {
        interface: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invalid ring geometry: {0}")]
    InvalidGeometry(String),

    /// Any other socket-level failure, including errors raised mid-capture.
    #[error("{op} on {interface} failed: {source}")]
    Socket {
        interface: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The session was stopped or has failed; reopen to continue.
    #[error("capture session closed")]
    Closed,

    #[error(transparent)]
    FlowTable(#[from] FlowTableError),
}

impl CaptureError {
    /// Classify a failed socket call, separating privilege problems.
    pub fn socket(interface: impl Into<String>, op: &'static str, source: io::Error) -> Self {
        let interface = interface.into();
        match source.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => Self::PermissionDenied { interface, op },
            _ => Self::Socket {
                interface,
                op,
                source,
            },
        }
    }

    pub fn ring(interface: impl Into<String>, op: &'static str, source: io::Error) -> Self {
        Self::RingSetupFailed {
            interface: interface.into(),
            op,
            source,
        }
    }
}

/// Errors from loading, attaching or reading the kernel flow table.
#[derive(Debug, Error)]
pub enum FlowTableError {
    #[error("failed to load flow tracker object: {0}")]
    Load(#[from] aya::EbpfError),

    #[error("program {0} not found in flow tracker object")]
    MissingProgram(&'static str),

    #[error("map {0} not found in flow tracker object")]
    MissingMap(&'static str),

    #[error("flow tracker program error: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[error("failed to attach XDP flow tracker on {interface}: {source}")]
    Attach {
        interface: String,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("flow map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("flow table capacity must be greater than zero")]
    ZeroCapacity,

    /// The binary was built without the XDP object (`FLOWTAP_EBPF=skip`
    /// or no BPF toolchain).
    #[error("xdp flow tracker was not built into this binary")]
    Unavailable,

    /// Flow tracking was configured off.
    #[error("flow tracking is disabled")]
    Disabled,
}
