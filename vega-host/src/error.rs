//! Error taxonomy of the graph runtime.
//!
//! These are the control-plane error kinds: they surface through `Result`
//! returns of graph, node and streamer construction APIs. Data-plane
//! conditions (overflow, underflow, timeout, bad packet) are reported through
//! the metadata of `recv`/`send` instead and never unwind. Invariant
//! violations (impossible code paths) panic.

use thiserror::Error;

/// Errors of the vega-host control plane.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown block, property id, channel or key.
    #[error("lookup error: {0}")]
    Lookup(String),
    /// A property was read or written with a value of a different type.
    #[error("type error: {0}")]
    Type(String),
    /// A resolver wrote a property outside its declared outputs or read a
    /// non-local property.
    #[error("access error: {0}")]
    Access(String),
    /// Out-of-range numeric or malformed string argument.
    #[error("value error: {0}")]
    Value(String),
    /// Property propagation did not converge, or back-edges are inconsistent.
    #[error("resolve error: {0}")]
    Resolve(String),
    /// The graph has a propagation cycle.
    #[error("cycle error: {0}")]
    Cycle(String),
    /// A node rejected the connection pattern at commit.
    #[error("topology error: {0}")]
    Topology(String),
    /// An action cascade exceeded the delivery cap.
    #[error("action loop error: {0}")]
    ActionLoop(String),
    /// The operation is not available on this hardware or software path.
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// CHDR codec failure.
    #[error("CHDR error: {0}")]
    Chdr(#[from] vega_chdr::Error),
    /// I/O failure in a link or register interface.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
