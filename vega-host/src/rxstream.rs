//! Multi-channel time-aligned receive streamer.
//!
//! The streamer joins the graph as a sink node (its per-channel `scaling`,
//! `samp_rate`, `tick_rate` and `type` input-edge properties are written by
//! upstream blocks during propagation) and reads sample data from one
//! [`RxLink`] per channel.
//!
//! Every [`recv`](RxStreamer::recv) call delivers samples that are
//! timestamp-aligned across all channels, or an explicit error code in the
//! metadata; misaligned data is never silently emitted. A sequence-number
//! skip means the device dropped packets (overrun): the call reports
//! `Overflow` once with the inferred time of the missing data, and the next
//! call flushes all channels, runs the overrun handler and resumes.

use crate::action::{Action, RxEventInfo, RxEventKind, StreamCommand, StreamMode};
use crate::args::StreamArgs;
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};
use crate::link::{RecvFrame, RxLink};
use crate::node::Node;
use crate::prop::{PropSource, PropType, PropValue, Property};
use crate::timespec::TimeSpec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

static STREAMER_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Error code delivered with receive metadata.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RxErrorCode {
    /// No error.
    #[default]
    None,
    /// No packet arrived within the caller's timeout.
    Timeout,
    /// The device dropped packets; the host could not keep up.
    Overflow,
    /// A packet failed CHDR parsing.
    BadPacket,
    /// The channels could not be time-aligned.
    Alignment,
}

/// Metadata of one `recv` call.
#[derive(Debug, Clone, Default)]
pub struct RxMetadata {
    /// Whether `time_spec` is valid.
    pub has_time_spec: bool,
    /// Device time of the first delivered sample.
    pub time_spec: TimeSpec,
    /// More samples of the current packet remain for the next call.
    pub more_fragments: bool,
    /// Offset in samples of this fragment within its packet.
    pub fragment_offset: usize,
    /// First packet of a burst.
    pub start_of_burst: bool,
    /// Last packet of a burst (logical OR across channels).
    pub end_of_burst: bool,
    /// A sequence discontinuity was observed.
    pub out_of_sequence: bool,
    /// Error code; anything other than `None` means zero samples.
    pub error_code: RxErrorCode,
}

/// Streamer state as visible to the control plane.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Not streaming.
    Idle,
    /// A start command was issued.
    Streaming,
    /// An overrun was detected; the next `recv` recovers.
    OverrunPending,
}

/// Values pushed into the streamer by property propagation.
///
/// Resolvers on the streamer node run under the graph mutex; `recv` picks
/// the values up at the start of each call.
#[derive(Debug)]
struct StreamerConfig {
    samp_rate: Mutex<f64>,
    tick_rate: Mutex<f64>,
    scale: Mutex<Vec<Option<f64>>>,
}

impl StreamerConfig {
    fn new(num_chans: usize) -> StreamerConfig {
        StreamerConfig {
            samp_rate: Mutex::new(1.0),
            tick_rate: Mutex::new(1.0),
            scale: Mutex::new(vec![None; num_chans]),
        }
    }

    fn set_scale(&self, chan: usize, scale: f64) {
        self.scale.lock().unwrap()[chan] = Some(scale);
    }
}

struct Channel {
    link: Box<dyn RxLink>,
    frame: Option<RecvFrame>,
    /// Payload bytes of the in-flight frame already delivered.
    consumed: usize,
    expected_seq: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default)]
struct LastRead {
    has_time_spec: bool,
    time_spec: TimeSpec,
    num_samps: usize,
}

/// Multi-channel receive streamer.
pub struct RxStreamer {
    graph: Arc<Graph>,
    node_id: NodeId,
    config: Arc<StreamerConfig>,
    channels: Vec<Option<Channel>>,
    converters: Vec<Converter>,
    samp_rate: f64,
    tick_rate: f64,
    spp: usize,
    state: StreamState,
    overrun_handler: Option<Box<dyn FnMut() + Send>>,
    stopped_due_to_overrun: bool,
    error_cache: Option<RxMetadata>,
    buff_samps_remaining: usize,
    fragment_offset: usize,
    last_fragment_md: RxMetadata,
    last_read: LastRead,
}

impl RxStreamer {
    /// Creates a receive streamer and registers its node with the graph.
    ///
    /// An unknown wire/host format combination fails here, at construction.
    /// The streamer node has one input port per channel and refuses to
    /// commit unless all of them are connected.
    pub fn new(graph: &Arc<Graph>, num_chans: usize, args: &StreamArgs) -> Result<RxStreamer> {
        if num_chans == 0 {
            return Err(Error::Value("streamer needs at least one channel".to_string()));
        }
        let mut converters = Vec::with_capacity(num_chans);
        for _ in 0..num_chans {
            converters.push(Converter::rx(args.otw_format, args.cpu_format)?);
        }
        let config = Arc::new(StreamerConfig::new(num_chans));

        let unique_id = format!("RxStreamer#{}", STREAMER_INSTANCE.fetch_add(1, Ordering::SeqCst));
        let mut node = Node::new(&unique_id, num_chans, 0);
        // There is nothing downstream of a streamer to forward to.
        node.set_prop_forwarding_policy(crate::node::ForwardingPolicy::Drop, None);
        node.set_action_forwarding_policy(crate::node::ForwardingPolicy::Drop, None);
        for chan in 0..num_chans {
            let scaling = node.register_property(Property::new(
                "scaling",
                PropSource::InputEdge(chan),
                PropType::Float,
            ))?;
            let samp_rate = node.register_property(Property::new(
                "samp_rate",
                PropSource::InputEdge(chan),
                PropType::Float,
            ))?;
            let tick_rate = node.register_property(Property::new(
                "tick_rate",
                PropSource::InputEdge(chan),
                PropType::Float,
            ))?;
            node.register_property(Property::with_value(
                "type",
                PropSource::InputEdge(chan),
                args.otw_format.to_string(),
            ))?;

            let cfg = Arc::clone(&config);
            node.add_resolver(&[scaling], &[], move |ctx| {
                if let Some(value) = ctx.value(scaling).and_then(PropValue::as_f64) {
                    cfg.set_scale(chan, value / 32767.0);
                }
                Ok(())
            })?;
            let cfg = Arc::clone(&config);
            node.add_resolver(&[samp_rate], &[], move |ctx| {
                if let Some(value) = ctx.value(samp_rate).and_then(PropValue::as_f64) {
                    *cfg.samp_rate.lock().unwrap() = value;
                }
                Ok(())
            })?;
            let cfg = Arc::clone(&config);
            node.add_resolver(&[tick_rate], &[], move |ctx| {
                if let Some(value) = ctx.value(tick_rate).and_then(PropValue::as_f64) {
                    *cfg.tick_rate.lock().unwrap() = value;
                }
                Ok(())
            })?;
        }
        node.set_topology_check(move |inputs, _| inputs.len() == num_chans);
        let node_id = graph.add_node(node)?;

        let spp = match args.spp {
            Some(spp) => spp,
            None => args.args.get_parsed("spp", usize::MAX)?,
        };
        Ok(RxStreamer {
            graph: Arc::clone(graph),
            node_id,
            config,
            channels: (0..num_chans).map(|_| None).collect(),
            converters,
            samp_rate: 1.0,
            tick_rate: 1.0,
            spp,
            state: StreamState::Idle,
            overrun_handler: None,
            stopped_due_to_overrun: false,
            error_cache: None,
            buff_samps_remaining: 0,
            fragment_offset: 0,
            last_fragment_md: RxMetadata::default(),
            last_read: LastRead::default(),
        })
    }

    /// Returns the graph node of this streamer, for `connect`.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Returns the number of channels.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Returns the maximum number of samples one packet carries.
    pub fn max_num_samps(&self) -> usize {
        self.spp
    }

    /// Returns the streamer state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Attaches the transport for one channel.
    pub fn connect_channel(&mut self, chan: usize, link: Box<dyn RxLink>) -> Result<()> {
        let num_chans = self.channels.len();
        let slot = self
            .channels
            .get_mut(chan)
            .ok_or_else(|| Error::Lookup(format!("no channel {chan} on a {num_chans}-channel streamer")))?;
        if slot.is_some() {
            return Err(Error::Value(format!("channel {chan} is already connected")));
        }
        let link_spp = link.max_payload_size() / self.converters[chan].bytes_per_wire_item();
        self.spp = self.spp.min(link_spp);
        *slot = Some(Channel {
            link,
            frame: None,
            consumed: 0,
            expected_seq: None,
        });
        Ok(())
    }

    /// Installs the handler that recovers from an overrun, typically by
    /// restarting the radios through a stream command.
    pub fn set_overrun_handler(&mut self, handler: impl FnMut() + Send + 'static) {
        self.overrun_handler = Some(Box::new(handler));
    }

    /// Issues a stream command on every channel.
    ///
    /// Starting multiple channels with `stream_now` cannot time-align, so it
    /// is rejected; use a timed start instead.
    pub fn issue_stream_cmd(&mut self, cmd: StreamCommand) -> Result<()> {
        if self.num_channels() > 1 && cmd.stream_now && cmd.mode != StreamMode::StopContinuous {
            return Err(Error::Value(
                "immediate stream command on a multi-channel streamer cannot time-align; \
                 use a timed start"
                    .to_string(),
            ));
        }
        for chan in 0..self.num_channels() {
            self.graph
                .post_action(self.node_id, PropSource::InputEdge(chan), Action::stream_cmd(cmd))?;
        }
        self.state = match cmd.mode {
            StreamMode::StopContinuous => StreamState::Idle,
            _ => StreamState::Streaming,
        };
        Ok(())
    }

    /// Receives samples into one buffer per channel.
    ///
    /// Returns the number of samples written to each buffer and the call's
    /// metadata. Runtime conditions (timeout, overflow, bad packets) are
    /// reported through the metadata error code with zero samples; `Err` is
    /// reserved for usage errors such as mismatched buffer counts.
    pub fn recv(
        &mut self,
        buffs: &mut [&mut [u8]],
        nsamps_per_buff: usize,
        timeout: Duration,
        one_packet: bool,
    ) -> Result<(usize, RxMetadata)> {
        if buffs.len() != self.num_channels() {
            return Err(Error::Value(format!(
                "{} buffers for a {}-channel streamer",
                buffs.len(),
                self.num_channels()
            )));
        }
        if self.channels.iter().any(Option::is_none) {
            return Err(Error::Value("not every channel has a transport".to_string()));
        }
        self.refresh_config();

        if let Some(cached) = self.error_cache.take() {
            return Ok((0, cached));
        }
        if self.stopped_due_to_overrun {
            self.handle_overrun();
        }

        let mut metadata = RxMetadata::default();
        let mut total = self.recv_one_packet(buffs, nsamps_per_buff, &mut metadata, timeout, 0)?;
        if metadata.error_code != RxErrorCode::None || metadata.end_of_burst || one_packet {
            if metadata.end_of_burst {
                self.state = StreamState::Idle;
            }
            return Ok((total, metadata));
        }

        while total < nsamps_per_buff {
            let mut loop_md = RxMetadata::default();
            let offset = total * self.converters[0].bytes_per_host_item();
            let num = self.recv_one_packet(
                buffs,
                nsamps_per_buff - total,
                &mut loop_md,
                timeout,
                offset,
            )?;
            if loop_md.error_code != RxErrorCode::None {
                // Samples were already delivered; surface the error on the
                // next call instead. Timeouts are the exception: the short
                // count already tells the caller.
                if loop_md.error_code != RxErrorCode::Timeout {
                    self.error_cache = Some(loop_md);
                }
                break;
            }
            total += num;
            if loop_md.end_of_burst {
                metadata.end_of_burst = true;
                self.state = StreamState::Idle;
                break;
            }
        }
        Ok((total, metadata))
    }

    fn refresh_config(&mut self) {
        self.samp_rate = *self.config.samp_rate.lock().unwrap();
        self.tick_rate = *self.config.tick_rate.lock().unwrap();
        let scales = self.config.scale.lock().unwrap();
        for (converter, scale) in self.converters.iter_mut().zip(scales.iter()) {
            if let Some(scale) = scale {
                converter.set_scale(*scale);
            }
        }
    }

    /// Flushes every channel, runs the overrun handler and leaves the
    /// overrun episode. Exactly one `Overflow` error was already surfaced.
    fn handle_overrun(&mut self) {
        tracing::debug!("recovering from overrun");
        for slot in &mut self.channels {
            let channel = slot.as_mut().expect("channel connected");
            if let Some(frame) = channel.frame.take() {
                channel.link.release_recv_buff(frame);
            }
            loop {
                match channel.link.recv(Duration::ZERO) {
                    Ok(Some(frame)) => channel.link.release_recv_buff(frame),
                    Ok(None) => break,
                    // A malformed frame was consumed; keep draining.
                    Err(_) => continue,
                }
            }
            channel.consumed = 0;
            channel.expected_seq = None;
        }
        self.buff_samps_remaining = 0;
        self.fragment_offset = 0;
        if let Some(handler) = self.overrun_handler.as_mut() {
            handler();
        } else {
            // Without a handler, ask upstream to restart.
            for chan in 0..self.channels.len() {
                let action = Action::rx_event(RxEventInfo {
                    kind: RxEventKind::RestartRequest,
                    channel: chan,
                });
                let _ = self
                    .graph
                    .post_action(self.node_id, PropSource::InputEdge(chan), action);
            }
        }
        self.stopped_due_to_overrun = false;
        self.state = StreamState::Idle;
    }

    /// Delivers samples from the current set of aligned packets, fetching a
    /// new aligned set when the previous one is exhausted.
    fn recv_one_packet(
        &mut self,
        buffs: &mut [&mut [u8]],
        nsamps: usize,
        metadata: &mut RxMetadata,
        timeout: Duration,
        offset_bytes: usize,
    ) -> Result<usize> {
        if self.buff_samps_remaining == 0 {
            let num_samps = self.get_aligned_frames(timeout, metadata);
            if metadata.error_code != RxErrorCode::None {
                return Ok(0);
            }
            self.buff_samps_remaining = num_samps;
            self.fragment_offset = 0;
        } else {
            *metadata = self.last_fragment_md.clone();
            metadata.time_spec = metadata.time_spec
                + TimeSpec::from_ticks(
                    (self.fragment_offset - metadata.fragment_offset) as i64,
                    self.samp_rate,
                );
        }
        if self.buff_samps_remaining == 0 {
            return Ok(0);
        }

        let num = nsamps.min(self.buff_samps_remaining);
        for chan in 0..self.channels.len() {
            let bytes = num * self.converters[chan].bytes_per_wire_item();
            let channel = self.channels[chan].as_mut().expect("channel connected");
            let frame = channel.frame.as_ref().expect("aligned frame in flight");
            let start = frame.info.payload_offset + channel.consumed;
            self.converters[chan].wire_to_host(
                &frame.data[start..start + bytes],
                &mut buffs[chan][offset_bytes..],
                num,
            )?;
            channel.consumed += bytes;
            if self.buff_samps_remaining == num {
                let frame = channel.frame.take().expect("frame in flight");
                channel.link.release_recv_buff(frame);
                channel.consumed = 0;
            }
        }
        self.buff_samps_remaining -= num;

        metadata.more_fragments = self.buff_samps_remaining != 0;
        metadata.fragment_offset = self.fragment_offset;
        if metadata.more_fragments {
            self.fragment_offset += num;
            self.last_fragment_md = metadata.clone();
        }
        Ok(num)
    }

    /// Obtains one packet per channel with matching timestamps.
    ///
    /// Returns the packet size in samples; on any error the metadata error
    /// code is set and zero is returned.
    fn get_aligned_frames(&mut self, timeout: Duration, metadata: &mut RxMetadata) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            // One in-flight packet per channel.
            for chan in 0..self.channels.len() {
                let channel = self.channels[chan].as_mut().expect("channel connected");
                if channel.frame.is_some() {
                    continue;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                match channel.link.recv(remaining) {
                    Err(err) => {
                        tracing::warn!(chan, %err, "bad packet");
                        metadata.error_code = RxErrorCode::BadPacket;
                        return 0;
                    }
                    Ok(None) => {
                        metadata.error_code = RxErrorCode::Timeout;
                        return 0;
                    }
                    Ok(Some(frame)) => {
                        let expected = channel.expected_seq;
                        channel.expected_seq = Some(frame.info.seq_num.wrapping_add(1));
                        let skipped =
                            expected.is_some_and(|expected| frame.info.seq_num != expected);
                        channel.frame = Some(frame);
                        channel.consumed = 0;
                        if skipped {
                            tracing::warn!(chan, "sequence discontinuity, device overrun");
                            metadata.has_time_spec = self.last_read.has_time_spec;
                            metadata.time_spec = self.last_read.time_spec
                                + TimeSpec::from_ticks(
                                    self.last_read.num_samps as i64,
                                    self.samp_rate,
                                );
                            metadata.out_of_sequence = true;
                            metadata.error_code = RxErrorCode::Overflow;
                            self.stopped_due_to_overrun = true;
                            self.state = StreamState::OverrunPending;
                            return 0;
                        }
                    }
                }
            }
            if self.channels.len() == 1 {
                break;
            }

            // Compare timestamps across channels; drop anything older than
            // the newest packet and fetch that channel again.
            let times: Vec<Option<u64>> = self
                .channels
                .iter()
                .map(|slot| {
                    let frame = slot.as_ref().unwrap().frame.as_ref().unwrap();
                    frame.info.has_tsf.then_some(frame.info.tsf)
                })
                .collect();
            let Some(newest) = times.iter().copied().flatten().max() else {
                // Untimed packets cannot be aligned any further.
                break;
            };
            if times.iter().any(|t| t.is_none()) {
                tracing::warn!("mix of timed and untimed packets across channels");
                metadata.error_code = RxErrorCode::Alignment;
                return 0;
            }
            let mut dropped = false;
            for (chan, time) in times.iter().enumerate() {
                if time.unwrap() < newest {
                    tracing::debug!(chan, "dropping packet older than other channels");
                    let channel = self.channels[chan].as_mut().unwrap();
                    let frame = channel.frame.take().unwrap();
                    channel.link.release_recv_buff(frame);
                }
                dropped |= time.unwrap() < newest;
            }
            if !dropped {
                break;
            }
        }

        // Aligned: aggregate the end-of-burst flags and take the time of
        // channel zero.
        let mut end_of_burst = false;
        for slot in &self.channels {
            end_of_burst |= slot.as_ref().unwrap().frame.as_ref().unwrap().info.eob;
        }
        let info0 = self.channels[0].as_ref().unwrap().frame.as_ref().unwrap().info;
        metadata.has_time_spec = info0.has_tsf;
        metadata.time_spec = TimeSpec::from_ticks(info0.tsf as i64, self.tick_rate);
        metadata.start_of_burst = false;
        metadata.end_of_burst = end_of_burst;
        metadata.error_code = RxErrorCode::None;

        let num_samps = info0.payload_bytes / self.converters[0].bytes_per_wire_item();
        self.last_read = LastRead {
            has_time_spec: metadata.has_time_spec,
            time_spec: metadata.time_spec,
            num_samps,
        };
        num_samps
    }
}

impl Drop for RxStreamer {
    fn drop(&mut self) {
        // Frames still in flight go back to their links.
        for slot in self.channels.iter_mut().flatten() {
            if let Some(frame) = slot.frame.take() {
                slot.link.release_recv_buff(frame);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::args::{SampleFormat, StreamArgs};
    use crate::convert::fc32_from_bytes;
    use crate::mock::{data_frame, ScriptedRxLink};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use vega_chdr::{ChdrWidth, Codec, Endianness};

    fn codec() -> Codec {
        Codec::new(ChdrWidth::W64, Endianness::Little)
    }

    fn streamer(num_chans: usize) -> (RxStreamer, Vec<Arc<Mutex<VecDeque<Bytes>>>>) {
        let graph = Arc::new(Graph::new());
        let args = StreamArgs::new(SampleFormat::Fc32, SampleFormat::Sc16);
        let mut streamer = RxStreamer::new(&graph, num_chans, &args).unwrap();
        let mut queues = Vec::new();
        for chan in 0..num_chans {
            let (link, queue) = ScriptedRxLink::new(codec(), 8000);
            streamer.connect_channel(chan, Box::new(link)).unwrap();
            queues.push(queue);
        }
        (streamer, queues)
    }

    fn recv(
        streamer: &mut RxStreamer,
        nsamps: usize,
        num_chans: usize,
    ) -> (usize, RxMetadata, Vec<Vec<u8>>) {
        let mut storage: Vec<Vec<u8>> = (0..num_chans).map(|_| vec![0u8; nsamps * 8]).collect();
        let mut buffs: Vec<&mut [u8]> = storage.iter_mut().map(|b| b.as_mut_slice()).collect();
        let (num, md) = streamer
            .recv(&mut buffs, nsamps, Duration::from_millis(10), false)
            .unwrap();
        (num, md, storage)
    }

    #[test]
    fn unknown_format_combination_fails_at_construction() {
        let graph = Arc::new(Graph::new());
        let args = StreamArgs::new(SampleFormat::Fc32, SampleFormat::Fc64);
        assert!(matches!(
            RxStreamer::new(&graph, 1, &args),
            Err(Error::Value(_))
        ));
    }

    #[test]
    fn fragmented_delivery_keeps_sample_accounting() {
        let (mut streamer, queues) = streamer(1);
        queues[0]
            .lock()
            .unwrap()
            .push_back(data_frame(&codec(), 0, Some(0), false, 100, 0));
        queues[0]
            .lock()
            .unwrap()
            .push_back(data_frame(&codec(), 1, Some(100), false, 100, 0));

        // 60 + 60 + 80 = the 200 samples of the two packets, with
        // timestamps advancing contiguously at the sample rate.
        let (num, md, _) = recv(&mut streamer, 60, 1);
        assert_eq!(num, 60);
        assert_eq!(md.error_code, RxErrorCode::None);
        assert_eq!(md.time_spec.secs(), 0.0);
        // 40 samples of the first packet are still pending.
        assert!(md.more_fragments);
        assert_eq!(md.fragment_offset, 0);

        let (num, md, _) = recv(&mut streamer, 60, 1);
        assert_eq!(num, 60);
        // This call starts on the residual 40 samples of packet one.
        assert_eq!(md.time_spec.secs(), 60.0);
        assert_eq!(md.fragment_offset, 60);

        let (num, md, _) = recv(&mut streamer, 80, 1);
        assert_eq!(num, 80);
        assert_eq!(md.time_spec.secs(), 120.0);

        // Everything consumed: the next call times out.
        let (num, md, _) = recv(&mut streamer, 10, 1);
        assert_eq!(num, 0);
        assert_eq!(md.error_code, RxErrorCode::Timeout);
    }

    #[test]
    fn samples_are_converted_with_default_scale() {
        let (mut streamer, queues) = streamer(1);
        queues[0]
            .lock()
            .unwrap()
            .push_back(data_frame(&codec(), 0, Some(0), false, 4, 100));
        let (num, _, storage) = recv(&mut streamer, 4, 1);
        assert_eq!(num, 4);
        let samples = fc32_from_bytes(&storage[0]);
        assert!((samples[0].re - 100.0 / 32767.0).abs() < 1e-6);
        assert!((samples[0].im - 101.0 / 32767.0).abs() < 1e-6);
        assert!((samples[3].im - 107.0 / 32767.0).abs() < 1e-6);
    }

    #[test]
    fn older_packets_are_dropped_for_alignment() {
        let (mut streamer, queues) = streamer(2);
        // Channel 0 has a stale packet from before channel 1 started.
        queues[0]
            .lock()
            .unwrap()
            .push_back(data_frame(&codec(), 0, Some(0), false, 10, 0));
        queues[0]
            .lock()
            .unwrap()
            .push_back(data_frame(&codec(), 1, Some(100), false, 10, 0));
        queues[1]
            .lock()
            .unwrap()
            .push_back(data_frame(&codec(), 0, Some(100), false, 10, 0));

        let (num, md, _) = recv(&mut streamer, 10, 2);
        assert_eq!(num, 10);
        assert_eq!(md.error_code, RxErrorCode::None);
        assert_eq!(md.time_spec.secs(), 100.0);
    }

    #[test]
    fn eob_is_merged_across_channels() {
        let (mut streamer, queues) = streamer(2);
        queues[0]
            .lock()
            .unwrap()
            .push_back(data_frame(&codec(), 0, Some(0), false, 10, 0));
        queues[1]
            .lock()
            .unwrap()
            .push_back(data_frame(&codec(), 0, Some(0), true, 10, 0));
        let (num, md, _) = recv(&mut streamer, 10, 2);
        assert_eq!(num, 10);
        assert!(md.end_of_burst);
        assert_eq!(streamer.state(), StreamState::Idle);
    }

    #[test]
    fn overrun_episode_surfaces_exactly_one_overflow() {
        let (mut streamer, queues) = streamer(2);
        for queue in &queues {
            queue
                .lock()
                .unwrap()
                .push_back(data_frame(&codec(), 0, Some(0), false, 100, 0));
        }
        // Channel 0 skips from 0 to 2: the device dropped a packet.
        queues[0]
            .lock()
            .unwrap()
            .push_back(data_frame(&codec(), 2, Some(200), false, 100, 0));
        queues[1]
            .lock()
            .unwrap()
            .push_back(data_frame(&codec(), 1, Some(100), false, 100, 0));

        let invocations = Arc::new(AtomicUsize::new(0));
        let handler_invocations = Arc::clone(&invocations);
        let handler_queues = queues.clone();
        let frame_codec = codec();
        streamer.set_overrun_handler(move || {
            handler_invocations.fetch_add(1, Ordering::SeqCst);
            // Pretend the radios restarted and fresh aligned data arrives.
            for (chan, queue) in handler_queues.iter().enumerate() {
                queue.lock().unwrap().push_back(data_frame(
                    &frame_codec,
                    10,
                    Some(500),
                    false,
                    100,
                    chan as i16,
                ));
            }
        });

        // First call: clean data.
        let (num, md, _) = recv(&mut streamer, 100, 2);
        assert_eq!(num, 100);
        assert_eq!(md.error_code, RxErrorCode::None);

        // Second call: the skip is detected. Zero samples, overflow, and
        // the inferred time of the missing packet.
        let (num, md, _) = recv(&mut streamer, 100, 2);
        assert_eq!(num, 0);
        assert_eq!(md.error_code, RxErrorCode::Overflow);
        assert!(md.out_of_sequence);
        assert!(md.has_time_spec);
        assert_eq!(md.time_spec.secs(), 100.0); // last time + samples/rate
        assert_eq!(streamer.state(), StreamState::OverrunPending);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);

        // Third call: queues flushed, handler runs exactly once, fresh data
        // flows with no error.
        let (num, md, _) = recv(&mut streamer, 100, 2);
        assert_eq!(num, 100);
        assert_eq!(md.error_code, RxErrorCode::None);
        assert_eq!(md.time_spec.secs(), 500.0);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multi_channel_stream_now_is_rejected() {
        let (mut streamer, _queues) = streamer(2);
        assert!(matches!(
            streamer.issue_stream_cmd(StreamCommand::start_continuous()),
            Err(Error::Value(_))
        ));
        // A timed start and an immediate stop are both fine.
        streamer
            .issue_stream_cmd(StreamCommand::start_continuous().at(TimeSpec::from_secs(1.0)))
            .unwrap();
        assert_eq!(streamer.state(), StreamState::Streaming);
        streamer
            .issue_stream_cmd(StreamCommand::stop_continuous())
            .unwrap();
        assert_eq!(streamer.state(), StreamState::Idle);
    }

    #[test]
    fn bad_packet_is_reported() {
        let (mut streamer, queues) = streamer(1);
        queues[0]
            .lock()
            .unwrap()
            .push_back(Bytes::from_static(&[0u8; 4]));
        let (num, md, _) = recv(&mut streamer, 10, 1);
        assert_eq!(num, 0);
        assert_eq!(md.error_code, RxErrorCode::BadPacket);
    }
}
