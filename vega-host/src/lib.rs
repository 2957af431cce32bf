//! vega-host is the host-side runtime of Vega SDR. It presents the
//! processing blocks on an FPGA radio device (radios, converters, FFTs,
//! FIFOs) as one user-composable computation graph: blocks and streamers are
//! connected by port, expose typed properties that propagate to a globally
//! consistent state before streaming starts, and route control actions
//! (most importantly stream start/stop commands) between each other. Sample
//! data flows over pluggable transport links as framed, sequence-numbered
//! CHDR packets; the codec for those lives in the [`vega_chdr`] crate.
//!
//! The usual shape of a session: create a [`graph::Graph`], add the block
//! nodes discovered through [`clientzero`], create streamers, wire
//! everything up with [`graph::Graph::connect`], and
//! [`commit`](graph::Graph::commit). From then on property changes resolve
//! immediately and the streamers move samples.

#![warn(missing_docs)]

pub mod action;
pub mod args;
pub mod clientzero;
pub mod convert;
pub mod epid;
pub mod error;
pub mod graph;
pub mod link;
pub mod node;
pub mod prop;
pub mod rxstream;
pub mod timespec;
pub mod txstream;

#[cfg(test)]
mod mock;
