//! Mock nodes and transports for the unit tests.
//!
//! The mock radio and DDC mirror the behavior of real source and
//! rate-changing blocks closely enough to exercise propagation, coercion
//! and action transforms without hardware: the radio insists on one of two
//! master clock rates, the DDC coerces its decimation to 1 or an even value
//! up to 512 and rescales stream commands, and the fifo forwards everything.

use crate::action::{ActionPayload, StreamMode, ACTION_KEY_STREAM_CMD};
use crate::link::{RecvFrame, RxLink};
use crate::node::{ForwardingPolicy, Node};
use crate::prop::{PropSource, PropType, PropValue, Property};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vega_chdr::{ChdrHeader, Codec, PacketType};

/// Counters recording what a mock radio was told to do.
#[derive(Debug, Default)]
pub(crate) struct RadioProbe {
    pub last_num_samps: Mutex<u64>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub rssi_resolver_runs: AtomicUsize,
}

/// A full-duplex radio with two master clock rates (100e6 and 200e6) and an
/// always-updating read-only RSSI.
pub(crate) fn mock_radio(idx: usize) -> (Node, Arc<RadioProbe>) {
    let probe = Arc::new(RadioProbe::default());
    let mut node = Node::new(format!("MOCK_RADIO{idx}"), 1, 1);
    let samp_rate_in = node
        .register_property(Property::with_value("samp_rate", PropSource::InputEdge(0), 200e6))
        .unwrap();
    let samp_rate_out = node
        .register_property(Property::with_value("samp_rate", PropSource::OutputEdge(0), 200e6))
        .unwrap();
    let master_clock_rate = node
        .register_property(Property::with_value(
            "master_clock_rate",
            PropSource::User(0),
            200e6,
        ))
        .unwrap();
    let rssi = node
        .register_property(Property::with_value("rssi", PropSource::User(0), 0.0))
        .unwrap();

    // The rates always snap back to the master clock rate.
    node.add_resolver(&[samp_rate_in], &[samp_rate_in], move |ctx| {
        let mcr = ctx.get_f64(master_clock_rate)?;
        ctx.set(samp_rate_in, mcr)
    })
    .unwrap();
    node.add_resolver(&[samp_rate_out], &[samp_rate_out], move |ctx| {
        let mcr = ctx.get_f64(master_clock_rate)?;
        ctx.set(samp_rate_out, mcr)
    })
    .unwrap();
    node.add_resolver(
        &[master_clock_rate],
        &[master_clock_rate, samp_rate_in, samp_rate_out],
        move |ctx| {
            let coerced = if ctx.get_f64(master_clock_rate)? > 150e6 {
                200e6
            } else {
                100e6
            };
            ctx.set(master_clock_rate, coerced)?;
            ctx.set(samp_rate_in, coerced)?;
            ctx.set(samp_rate_out, coerced)
        },
    )
    .unwrap();
    let rssi_probe = Arc::clone(&probe);
    let dirtifier = node.always_dirty();
    node.add_resolver(&[dirtifier], &[rssi], move |ctx| {
        let runs = rssi_probe.rssi_resolver_runs.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.set(rssi, runs as f64)
    })
    .unwrap();

    node.set_action_forwarding_policy(ForwardingPolicy::Drop, None);
    let cmd_probe = Arc::clone(&probe);
    node.set_action_handler(ACTION_KEY_STREAM_CMD, move |_ctx, _edge, action| {
        if let ActionPayload::StreamCmd(cmd) = &action.payload {
            match cmd.mode {
                StreamMode::StartContinuous => {
                    cmd_probe.starts.fetch_add(1, Ordering::SeqCst);
                }
                StreamMode::StopContinuous => {
                    cmd_probe.stops.fetch_add(1, Ordering::SeqCst);
                }
                StreamMode::NumSampsAndDone | StreamMode::NumSampsAndMore => {
                    *cmd_probe.last_num_samps.lock().unwrap() = cmd.num_samps;
                }
            }
        }
        Ok(Vec::new())
    });
    (node, probe)
}

/// Decimation the mock DDC can actually hit: 1 or an even factor up to 512.
pub(crate) fn coerce_decim(requested: i64) -> i64 {
    if requested <= 1 {
        return 1;
    }
    (requested - requested % 2).min(512)
}

/// A single-channel decimator keeping input rate, output rate and
/// decimation consistent, and rescaling stream commands in flight.
pub(crate) fn mock_ddc() -> Node {
    let mut node = Node::new("MOCK_DDC", 1, 1);
    let samp_rate_in = node
        .register_property(Property::with_value("samp_rate", PropSource::InputEdge(0), 1e9))
        .unwrap();
    let samp_rate_out = node
        .register_property(Property::with_value("samp_rate", PropSource::OutputEdge(0), 1e9))
        .unwrap();
    let decim = node
        .register_property(Property::with_value("decim", PropSource::User(0), 1i64))
        .unwrap();

    // User changed the decimation: coerce it, keep the input rate, derive
    // the output rate.
    node.add_resolver(&[decim], &[decim, samp_rate_out], move |ctx| {
        let coerced = coerce_decim(ctx.get_i64(decim)?);
        let rate_in = ctx.get_f64(samp_rate_in)?;
        ctx.set(decim, coerced)?;
        ctx.set(samp_rate_out, rate_in / coerced as f64)
    })
    .unwrap();
    // Input rate changed: match the decimation so the output rate survives
    // if possible.
    node.add_resolver(&[samp_rate_in], &[decim, samp_rate_out], move |ctx| {
        let rate_in = ctx.get_f64(samp_rate_in)?;
        let requested = (rate_in / ctx.get_f64(samp_rate_out)?).round() as i64;
        let coerced = coerce_decim(requested);
        if coerced != requested {
            tracing::warn!(requested, coerced, "coercing decimation");
        }
        ctx.set(decim, coerced)?;
        ctx.set(samp_rate_out, rate_in / coerced as f64)
    })
    .unwrap();
    // Output rate changed: like the previous one, flipped.
    node.add_resolver(&[samp_rate_out], &[decim, samp_rate_in], move |ctx| {
        let rate_out = ctx.get_f64(samp_rate_out)?;
        let requested = (ctx.get_f64(samp_rate_in)? / rate_out).round() as i64;
        let coerced = coerce_decim(requested);
        if coerced != requested {
            tracing::warn!(requested, coerced, "coercing decimation");
        }
        ctx.set(decim, coerced)?;
        ctx.set(samp_rate_in, rate_out * coerced as f64)
    })
    .unwrap();

    node.set_action_handler(ACTION_KEY_STREAM_CMD, move |ctx, edge, action| {
        let decimation = ctx
            .value("decim", PropSource::User(0))
            .and_then(PropValue::as_i64)
            .unwrap_or(1) as u64;
        if let ActionPayload::StreamCmd(cmd) = &mut action.payload {
            match cmd.mode {
                StreamMode::StartContinuous | StreamMode::StopContinuous => {}
                StreamMode::NumSampsAndDone | StreamMode::NumSampsAndMore => {
                    // Keep "number of output samples requested" semantics:
                    // going upstream the device must produce more samples.
                    if matches!(edge, PropSource::OutputEdge(_)) {
                        cmd.num_samps *= decimation;
                    } else {
                        cmd.num_samps /= decimation;
                    }
                }
            }
        }
        let target = edge.invert().expect("stream commands arrive on edges");
        Ok(vec![(target, action.clone())])
    });
    node
}

/// A fifo: no properties of its own, forwards everything one-to-one.
pub(crate) fn mock_fifo(num_ports: usize, id: &str) -> Node {
    let mut node = Node::new(id, num_ports, num_ports);
    node.set_prop_forwarding_policy(ForwardingPolicy::OneToOne, None);
    node.set_action_forwarding_policy(ForwardingPolicy::OneToOne, None);
    node
}

/// A streaming sink: accepts a user-requested rate, requires every input
/// connected, and terminates propagation.
pub(crate) fn mock_sink(num_ports: usize) -> Node {
    let mut node = Node::new(format!("MOCK_SINK{num_ports}"), num_ports, 0);
    node.set_prop_forwarding_policy(ForwardingPolicy::Drop, None);
    node.set_action_forwarding_policy(ForwardingPolicy::Drop, None);
    let samp_rate_user = node
        .register_property(Property::new("samp_rate", PropSource::User(0), PropType::Float))
        .unwrap();
    let mut rate_ins = Vec::with_capacity(num_ports);
    for port in 0..num_ports {
        rate_ins.push(
            node.register_property(Property::new(
                "samp_rate",
                PropSource::InputEdge(port),
                PropType::Float,
            ))
            .unwrap(),
        );
    }
    let outputs = rate_ins.clone();
    node.add_resolver(&[samp_rate_user], &outputs.clone(), move |ctx| {
        if let Some(rate) = ctx.value(samp_rate_user).and_then(PropValue::as_f64) {
            for &input in &outputs {
                ctx.set(input, rate)?;
            }
        }
        Ok(())
    })
    .unwrap();
    node.set_topology_check(move |inputs, _| inputs.len() == num_ports);
    node
}

/// Receive link replaying frames from a queue shared with the test, so
/// frames can be injected while the streamer owns the link.
#[derive(Debug)]
pub(crate) struct ScriptedRxLink {
    codec: Codec,
    frames: Arc<Mutex<VecDeque<Bytes>>>,
    max_payload: usize,
}

impl ScriptedRxLink {
    pub(crate) fn new(
        codec: Codec,
        max_payload: usize,
    ) -> (ScriptedRxLink, Arc<Mutex<VecDeque<Bytes>>>) {
        let frames = Arc::new(Mutex::new(VecDeque::new()));
        (
            ScriptedRxLink {
                codec,
                frames: Arc::clone(&frames),
                max_payload,
            },
            frames,
        )
    }
}

impl RxLink for ScriptedRxLink {
    fn recv(&mut self, _timeout: Duration) -> crate::error::Result<Option<RecvFrame>> {
        match self.frames.lock().unwrap().pop_front() {
            Some(data) => {
                let info = self.codec.packet_info(&data)?;
                Ok(Some(RecvFrame { data, info }))
            }
            None => Ok(None),
        }
    }

    fn release_recv_buff(&mut self, frame: RecvFrame) {
        drop(frame);
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }
}

/// Builds a timestamped data frame carrying `nsamps` sc16 samples whose
/// 16-bit components count up from `first_value`.
pub(crate) fn data_frame(
    codec: &Codec,
    seq_num: u16,
    tsf: Option<u64>,
    eob: bool,
    nsamps: usize,
    first_value: i16,
) -> Bytes {
    let mut header = ChdrHeader::new(if tsf.is_some() {
        PacketType::DataWithTs
    } else {
        PacketType::DataNoTs
    });
    header.seq_num = seq_num;
    header.eob = eob;
    let mut payload = Vec::with_capacity(nsamps * 4);
    for i in 0..nsamps as i16 * 2 {
        payload.extend_from_slice(&(first_value + i).to_le_bytes());
    }
    let mut buf = vec![0u8; (payload.len() + 64).next_multiple_of(64)];
    let len = codec
        .serialize_data(&header, tsf, &[], &payload, &mut buf)
        .unwrap();
    buf.truncate(len);
    Bytes::from(buf)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decimation_coercion() {
        assert_eq!(coerce_decim(1), 1);
        assert_eq!(coerce_decim(2), 2);
        assert_eq!(coerce_decim(3), 2);
        assert_eq!(coerce_decim(513), 512);
        assert_eq!(coerce_decim(1212), 512);
    }
}
