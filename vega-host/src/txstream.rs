//! Transmit streamer.
//!
//! The symmetric path to [`rxstream`](crate::rxstream): host samples are
//! converted to the wire format, split into CHDR data packets at the link's
//! maximum payload size, numbered per channel, and handed to one [`TxLink`]
//! per channel. The first packet of a burst carries the caller's timestamp;
//! the rest of the burst goes out untimed.
//!
//! A credit window bounds the data in flight towards the device: inbound
//! stream-status packets report the downstream buffer capacity and the
//! transfer counts, and `send` blocks (up to the caller's timeout) while
//! the window is exhausted.

use crate::args::StreamArgs;
use crate::convert::Converter;
use crate::epid::Epid;
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};
use crate::link::TxLink;
use crate::node::{ForwardingPolicy, Node};
use crate::prop::{PropSource, PropType, PropValue, Property};
use crate::timespec::TimeSpec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use vega_chdr::payload::{StrsPayload, StrsStatus};
use vega_chdr::{ChdrHeader, Codec, PacketType};

static STREAMER_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Metadata attached to a `send` call.
#[derive(Debug, Clone, Default)]
pub struct TxMetadata {
    /// Whether `time_spec` is valid.
    pub has_time_spec: bool,
    /// Device time at which the first sample transmits.
    pub time_spec: TimeSpec,
    /// First packet of a burst.
    pub start_of_burst: bool,
    /// Last packet of a burst.
    pub end_of_burst: bool,
}

/// Asynchronous transmit events, reported by the device through
/// stream-status packets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxEvent {
    /// The device ran out of samples mid-burst.
    Underflow,
    /// The device saw a sequence discontinuity.
    SeqError,
    /// A timed burst arrived after its time had passed.
    TimeError,
}

/// Values pushed into the streamer by property propagation.
#[derive(Debug)]
struct TxConfig {
    samp_rate: Mutex<f64>,
    tick_rate: Mutex<f64>,
    scale: Mutex<Vec<Option<f64>>>,
}

/// Flow-control credit window of one channel.
///
/// Until the first stream-status packet announces a capacity, the window is
/// unbounded.
#[derive(Debug, Default)]
struct FlowControl {
    capacity_bytes: u64,
    capacity_pkts: u64,
    sent_bytes: u64,
    sent_pkts: u64,
    acked_bytes: u64,
    acked_pkts: u64,
}

impl FlowControl {
    fn has_credit(&self, frame_bytes: u64) -> bool {
        if self.capacity_bytes == 0 {
            return true;
        }
        // The device's transfer counts are not validated against the local
        // tally: a status frame may acknowledge more than this channel has
        // recorded as sent (counters surviving a reconnect, or a report
        // arriving before the first send). Saturate instead of underflowing
        // into unbounded credit.
        self.sent_bytes.saturating_sub(self.acked_bytes) + frame_bytes <= self.capacity_bytes
            && self.sent_pkts.saturating_sub(self.acked_pkts) < self.capacity_pkts
    }

    fn update(&mut self, strs: &StrsPayload) {
        self.capacity_bytes = strs.capacity_bytes;
        self.capacity_pkts = strs.capacity_pkts as u64;
        self.acked_bytes = strs.xfer_count_bytes;
        self.acked_pkts = strs.xfer_count_pkts;
    }
}

struct TxChannel {
    link: Box<dyn TxLink>,
    dst_epid: Epid,
    seq_num: u16,
    fc: FlowControl,
    pending_events: VecDeque<TxEvent>,
}

/// Multi-channel transmit streamer.
pub struct TxStreamer {
    graph: Arc<Graph>,
    node_id: NodeId,
    config: Arc<TxConfig>,
    channels: Vec<Option<TxChannel>>,
    converters: Vec<Converter>,
    codec: Codec,
    samp_rate: f64,
    tick_rate: f64,
    spp: usize,
    in_burst: bool,
    metadata_cache: Option<TxMetadata>,
}

impl TxStreamer {
    /// Creates a transmit streamer and registers its node with the graph.
    pub fn new(
        graph: &Arc<Graph>,
        num_chans: usize,
        args: &StreamArgs,
        codec: Codec,
    ) -> Result<TxStreamer> {
        if num_chans == 0 {
            return Err(Error::Value("streamer needs at least one channel".to_string()));
        }
        let mut converters = Vec::with_capacity(num_chans);
        for _ in 0..num_chans {
            converters.push(Converter::tx(args.cpu_format, args.otw_format)?);
        }
        let config = Arc::new(TxConfig {
            samp_rate: Mutex::new(1.0),
            tick_rate: Mutex::new(1.0),
            scale: Mutex::new(vec![None; num_chans]),
        });

        let unique_id = format!("TxStreamer#{}", STREAMER_INSTANCE.fetch_add(1, Ordering::SeqCst));
        let mut node = Node::new(&unique_id, 0, num_chans);
        node.set_prop_forwarding_policy(ForwardingPolicy::Drop, None);
        node.set_action_forwarding_policy(ForwardingPolicy::Drop, None);
        for chan in 0..num_chans {
            let scaling = node.register_property(Property::new(
                "scaling",
                PropSource::OutputEdge(chan),
                PropType::Float,
            ))?;
            let samp_rate = node.register_property(Property::new(
                "samp_rate",
                PropSource::OutputEdge(chan),
                PropType::Float,
            ))?;
            let tick_rate = node.register_property(Property::new(
                "tick_rate",
                PropSource::OutputEdge(chan),
                PropType::Float,
            ))?;
            node.register_property(Property::with_value(
                "type",
                PropSource::OutputEdge(chan),
                args.otw_format.to_string(),
            ))?;

            let cfg = Arc::clone(&config);
            node.add_resolver(&[scaling], &[], move |ctx| {
                if let Some(value) = ctx.value(scaling).and_then(PropValue::as_f64) {
                    cfg.scale.lock().unwrap()[chan] = Some(value);
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
        node.set_topology_check(move |_, outputs| outputs.len() == num_chans);
        let node_id = graph.add_node(node)?;

        let spp = match args.spp {
            Some(spp) => spp,
            None => args.args.get_parsed("spp", usize::MAX)?,
        };
        Ok(TxStreamer {
            graph: Arc::clone(graph),
            node_id,
            config,
            channels: (0..num_chans).map(|_| None).collect(),
            converters,
            codec,
            samp_rate: 1.0,
            tick_rate: 1.0,
            spp,
            in_burst: false,
            metadata_cache: None,
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

    /// Attaches the transport for one channel, addressed to the given
    /// stream endpoint.
    pub fn connect_channel(
        &mut self,
        chan: usize,
        link: Box<dyn TxLink>,
        dst_epid: Epid,
    ) -> Result<()> {
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
        *slot = Some(TxChannel {
            link,
            dst_epid,
            seq_num: 0,
            fc: FlowControl::default(),
            pending_events: VecDeque::new(),
        });
        Ok(())
    }

    /// Sends samples from one buffer per channel.
    ///
    /// Returns the number of samples accepted per channel; `0` means the
    /// flow-control window or the frame pool stayed exhausted for the whole
    /// timeout.
    pub fn send(
        &mut self,
        buffs: &[&[u8]],
        nsamps_per_buff: usize,
        metadata: &TxMetadata,
        timeout: Duration,
    ) -> Result<usize> {
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
        let mut metadata = metadata.clone();

        // A start-of-burst with no samples only deposits its metadata; it is
        // applied to the next call that has samples.
        if nsamps_per_buff == 0 && metadata.start_of_burst {
            self.metadata_cache = Some(metadata);
            return Ok(0);
        }
        if let Some(cached) = self.metadata_cache.take() {
            if !metadata.has_time_spec {
                metadata.has_time_spec = cached.has_time_spec;
                metadata.time_spec = cached.time_spec;
            }
            metadata.start_of_burst = cached.start_of_burst;
            metadata.end_of_burst = cached.end_of_burst || metadata.end_of_burst;
        }

        let deadline = Instant::now() + timeout;
        if nsamps_per_buff == 0 {
            // End-of-burst and friends still need a packet on the wire, and
            // a data packet carries at least one sample.
            let zeros = vec![0u8; self.converters[0].bytes_per_host_item()];
            let zero_buffs: Vec<&[u8]> = (0..self.num_channels()).map(|_| zeros.as_slice()).collect();
            self.send_one_packet(&zero_buffs, 0, 1, &metadata, deadline)?;
            return Ok(0);
        }

        if nsamps_per_buff <= self.spp {
            return self.send_one_packet(buffs, 0, nsamps_per_buff, &metadata, deadline);
        }

        // Split into packets of at most spp samples; only the last one may
        // carry the end-of-burst flag.
        let end_of_burst = metadata.end_of_burst;
        metadata.end_of_burst = false;
        let num_fragments = (nsamps_per_buff - 1) / self.spp;
        let final_length = (nsamps_per_buff - 1) % self.spp + 1;
        let mut total = 0;
        for _ in 0..num_fragments {
            let sent = self.send_one_packet(buffs, total, self.spp, &metadata, deadline)?;
            total += sent;
            if sent == 0 {
                return Ok(total);
            }
            if metadata.has_time_spec {
                metadata.time_spec =
                    metadata.time_spec + TimeSpec::from_ticks(sent as i64, self.samp_rate);
            }
            metadata.start_of_burst = false;
        }
        metadata.end_of_burst = end_of_burst;
        total += self.send_one_packet(buffs, total, final_length, &metadata, deadline)?;
        Ok(total)
    }

    /// Polls for an asynchronous transmit event.
    pub fn recv_async_msg(&mut self, timeout: Duration) -> Option<TxEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            for chan in 0..self.channels.len() {
                self.poll_status(chan);
                if let Some(event) = self.channels[chan]
                    .as_mut()
                    .and_then(|ch| ch.pending_events.pop_front())
                {
                    return Some(event);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
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

    /// Drains inbound stream-status frames of one channel into the credit
    /// window and the event queue.
    fn poll_status(&mut self, chan: usize) {
        let codec = self.codec;
        let Some(channel) = self.channels[chan].as_mut() else {
            return;
        };
        while let Some(status) = channel.link.try_recv_status() {
            match codec.parse_strs(&status) {
                Ok((_, strs)) => {
                    channel.fc.update(&strs);
                    let event = match strs.status {
                        StrsStatus::Okay => None,
                        StrsStatus::SeqErr => Some(TxEvent::SeqError),
                        StrsStatus::DataErr => Some(TxEvent::Underflow),
                        StrsStatus::RtErr => Some(TxEvent::TimeError),
                        StrsStatus::CmdErr => None,
                    };
                    if let Some(event) = event {
                        tracing::warn!(chan, ?event, "device reported stream error");
                        channel.pending_events.push_back(event);
                    }
                }
                Err(err) => tracing::warn!(chan, %err, "undecodable stream status"),
            }
        }
    }

    /// Converts and transmits one packet per channel.
    fn send_one_packet(
        &mut self,
        buffs: &[&[u8]],
        offset_samps: usize,
        num_samps: usize,
        metadata: &TxMetadata,
        deadline: Instant,
    ) -> Result<usize> {
        let stamp = metadata.has_time_spec && !self.in_burst;
        for chan in 0..self.channels.len() {
            let wire_bytes = num_samps * self.converters[chan].bytes_per_wire_item();
            let frame_bytes = (self
                .codec
                .payload_offset(&ChdrHeader::new(PacketType::DataWithTs))
                + wire_bytes) as u64;

            // Block on the credit window.
            loop {
                self.poll_status(chan);
                let channel = self.channels[chan].as_ref().expect("channel connected");
                if channel.fc.has_credit(frame_bytes) {
                    break;
                }
                if Instant::now() >= deadline {
                    tracing::debug!(chan, "flow control window exhausted");
                    return Ok(0);
                }
                std::thread::sleep(Duration::from_micros(50));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let acquired = self.channels[chan]
                .as_mut()
                .expect("channel connected")
                .link
                .acquire_send_buff(remaining)?;
            let Some(mut frame) = acquired else {
                return Ok(0);
            };

            let mut wire = vec![0u8; wire_bytes];
            let offset_bytes = offset_samps * self.converters[chan].bytes_per_host_item();
            self.converters[chan].host_to_wire(
                &buffs[chan][offset_bytes..],
                &mut wire,
                num_samps,
            )?;

            let channel = self.channels[chan].as_mut().expect("channel connected");
            let mut header = ChdrHeader::new(if stamp {
                PacketType::DataWithTs
            } else {
                PacketType::DataNoTs
            });
            header.seq_num = channel.seq_num;
            header.eob = metadata.end_of_burst;
            header.dst_epid = channel.dst_epid.0;
            let timestamp = stamp.then(|| metadata.time_spec.to_ticks(self.tick_rate) as u64);
            let len = self
                .codec
                .serialize_data(&header, timestamp, &[], &wire, &mut frame.data)?;
            channel.link.release_send_buff(frame, len)?;
            channel.seq_num = channel.seq_num.wrapping_add(1);
            channel.fc.sent_bytes += len as u64;
            channel.fc.sent_pkts += 1;
        }
        self.in_burst = !metadata.end_of_burst;
        Ok(num_samps)
    }
}
