//! Control actions routed through the graph.
//!
//! Actions are runtime commands that nodes send each other along graph
//! edges, in contrast to properties, which describe propagated state. The
//! canonical action is the stream command that starts or stops sample
//! streaming; nodes between the streamer and the radio may transform the
//! payload in flight (a decimator scales the requested sample count).

use crate::timespec::TimeSpec;
use bytes::Bytes;

/// Key of stream-command actions.
pub const ACTION_KEY_STREAM_CMD: &str = "stream_cmd";

/// Key of receive-event actions (overruns and restart handshakes).
pub const ACTION_KEY_RX_EVENT: &str = "rx_event";

/// Streaming mode requested by a stream command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamMode {
    /// Stream until told otherwise.
    StartContinuous,
    /// Stop streaming.
    StopContinuous,
    /// Stream `num_samps` samples and end the burst.
    NumSampsAndDone,
    /// Stream `num_samps` samples, more will be requested.
    NumSampsAndMore,
}

/// A stream start/stop command, optionally pinned to a device time.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct StreamCommand {
    /// Requested streaming mode.
    pub mode: StreamMode,
    /// Number of samples, for the counted modes. The count is in output
    /// samples at the point where the command is issued; rate-changing nodes
    /// rescale it while routing the command upstream.
    pub num_samps: u64,
    /// Start immediately instead of at `time`.
    pub stream_now: bool,
    /// Start time in device time, when not starting immediately.
    pub time: Option<TimeSpec>,
}

impl StreamCommand {
    /// Starts continuous streaming immediately.
    pub fn start_continuous() -> StreamCommand {
        StreamCommand {
            mode: StreamMode::StartContinuous,
            num_samps: 0,
            stream_now: true,
            time: None,
        }
    }

    /// Stops continuous streaming.
    pub fn stop_continuous() -> StreamCommand {
        StreamCommand {
            mode: StreamMode::StopContinuous,
            num_samps: 0,
            stream_now: true,
            time: None,
        }
    }

    /// Streams a finite number of samples immediately.
    pub fn num_samps_and_done(num_samps: u64) -> StreamCommand {
        StreamCommand {
            mode: StreamMode::NumSampsAndDone,
            num_samps,
            stream_now: true,
            time: None,
        }
    }

    /// Delays the command to the given device time.
    pub fn at(mut self, time: TimeSpec) -> StreamCommand {
        self.stream_now = false;
        self.time = Some(time);
        self
    }
}

/// Receive-path event kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RxEventKind {
    /// The device dropped packets because the host could not keep up.
    Overrun,
    /// Request to restart streaming after an overrun.
    RestartRequest,
}

/// Payload of a receive-event action.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RxEventInfo {
    /// What happened.
    pub kind: RxEventKind,
    /// Channel on which the event was observed.
    pub channel: usize,
}

/// Payload of an action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    /// A stream start/stop command.
    StreamCmd(StreamCommand),
    /// A receive-path event.
    RxEvent(RxEventInfo),
    /// Anything else; producer and consumer agree on the encoding.
    Opaque(Bytes),
}

/// An action envelope.
///
/// The id is assigned by the graph when the action is first enqueued and is
/// unique per graph; forwarded copies of an action keep the id of the
/// original.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// Unique id; 0 until the graph assigns one.
    pub id: u64,
    /// Handler key.
    pub key: String,
    /// Payload.
    pub payload: ActionPayload,
}

impl Action {
    /// Creates an action with the given key and payload.
    pub fn new(key: impl Into<String>, payload: ActionPayload) -> Action {
        Action {
            id: 0,
            key: key.into(),
            payload,
        }
    }

    /// Creates a stream-command action.
    pub fn stream_cmd(cmd: StreamCommand) -> Action {
        Action::new(ACTION_KEY_STREAM_CMD, ActionPayload::StreamCmd(cmd))
    }

    /// Creates a receive-event action.
    pub fn rx_event(info: RxEventInfo) -> Action {
        Action::new(ACTION_KEY_RX_EVENT, ActionPayload::RxEvent(info))
    }
}
