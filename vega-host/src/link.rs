//! Transport link abstraction.
//!
//! A link moves opaque CHDR frame buffers between the host and one stream
//! endpoint on a device. The streamers are written against the [`RxLink`]
//! and [`TxLink`] traits; what is underneath (UDP socket, DMA ring, or the
//! in-memory [`ChannelRxLink`]/[`ChannelTxLink`] pair used for loopback and
//! tests) is none of their business.
//!
//! Frame buffers are owned by value between acquire and release, so a
//! double release does not compile instead of being a runtime invariant
//! violation.

use crate::args::DeviceAddr;
use crate::error::Result;
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use vega_chdr::{ChdrHeader, Codec, PacketInfo, PacketType};

/// A received frame: the raw buffer plus the framing information parsed
/// from its CHDR header.
#[derive(Debug)]
pub struct RecvFrame {
    /// The raw frame, starting at the CHDR header.
    pub data: Bytes,
    /// Parsed framing information.
    pub info: PacketInfo,
}

/// Receive side of a transport link.
pub trait RxLink: Send {
    /// Waits up to `timeout` for the next frame.
    ///
    /// Returns `Ok(None)` on timeout. A frame that arrives but fails CHDR
    /// parsing is an error; the caller reports it as a bad packet.
    fn recv(&mut self, timeout: Duration) -> Result<Option<RecvFrame>>;

    /// Returns a frame to the transport for reuse.
    fn release_recv_buff(&mut self, frame: RecvFrame);

    /// Maximum payload bytes a data packet on this link can carry.
    fn max_payload_size(&self) -> usize;
}

/// A frame buffer being filled for transmission.
#[derive(Debug)]
pub struct SendFrame {
    /// The frame buffer; the CHDR packet is serialized into its front.
    pub data: BytesMut,
}

/// Transmit side of a transport link.
pub trait TxLink: Send {
    /// Waits up to `timeout` for a free frame buffer.
    fn acquire_send_buff(&mut self, timeout: Duration) -> Result<Option<SendFrame>>;

    /// Hands a filled frame to the transport. `len` is the number of valid
    /// bytes at the front of the buffer.
    fn release_send_buff(&mut self, frame: SendFrame, len: usize) -> Result<()>;

    /// Polls for an inbound stream-status frame, without blocking.
    fn try_recv_status(&mut self) -> Option<Bytes>;

    /// Maximum payload bytes a data packet on this link can carry.
    fn max_payload_size(&self) -> usize;
}

/// Frame-pool and buffer sizing, taken verbatim from the caller's device
/// options.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LinkParams {
    /// Size in bytes of one receive frame.
    pub recv_frame_size: usize,
    /// Number of receive frames in flight.
    pub num_recv_frames: usize,
    /// Size in bytes of one send frame.
    pub send_frame_size: usize,
    /// Number of send frames in flight.
    pub num_send_frames: usize,
    /// Total receive buffering in bytes, for transports with a buffer below
    /// the frame pool (socket buffer, DMA ring). `None` keeps the transport
    /// default.
    pub recv_buff_size: Option<usize>,
    /// Total send buffering in bytes.
    pub send_buff_size: Option<usize>,
}

impl Default for LinkParams {
    fn default() -> LinkParams {
        LinkParams {
            recv_frame_size: 8192,
            num_recv_frames: 32,
            send_frame_size: 8192,
            num_send_frames: 32,
            recv_buff_size: None,
            send_buff_size: None,
        }
    }
}

fn parse_optional(addr: &DeviceAddr, key: &str) -> Result<Option<usize>> {
    if addr.has_key(key) {
        Ok(Some(addr.get_parsed(key, 0)?))
    } else {
        Ok(None)
    }
}

impl LinkParams {
    /// Reads the transport-tuning keys out of a device address, falling
    /// back to the defaults for absent keys.
    ///
    /// An explicit `num_recv_frames`/`num_send_frames` wins; otherwise a
    /// total `recv_buff_size`/`send_buff_size` implies how many frames fit.
    /// The buffer sizes are also kept as-is for transports that size a
    /// lower-level buffer from them.
    pub fn from_device_addr(addr: &DeviceAddr) -> Result<LinkParams> {
        let defaults = LinkParams::default();
        let recv_frame_size = addr.get_parsed("recv_frame_size", defaults.recv_frame_size)?;
        let send_frame_size = addr.get_parsed("send_frame_size", defaults.send_frame_size)?;
        if recv_frame_size == 0 || send_frame_size == 0 {
            return Err(crate::error::Error::Value(
                "frame sizes must be non-zero".to_string(),
            ));
        }
        let recv_buff_size = parse_optional(addr, "recv_buff_size")?;
        let send_buff_size = parse_optional(addr, "send_buff_size")?;
        let num_recv_frames = if addr.has_key("num_recv_frames") {
            addr.get_parsed("num_recv_frames", defaults.num_recv_frames)?
        } else if let Some(buff_size) = recv_buff_size {
            (buff_size / recv_frame_size).max(1)
        } else {
            defaults.num_recv_frames
        };
        let num_send_frames = if addr.has_key("num_send_frames") {
            addr.get_parsed("num_send_frames", defaults.num_send_frames)?
        } else if let Some(buff_size) = send_buff_size {
            (buff_size / send_frame_size).max(1)
        } else {
            defaults.num_send_frames
        };
        Ok(LinkParams {
            recv_frame_size,
            num_recv_frames,
            send_frame_size,
            num_send_frames,
            recv_buff_size,
            send_buff_size,
        })
    }
}

/// Overhead of a timestamped data packet on the given codec: header plus
/// timestamp word(s).
fn data_packet_overhead(codec: &Codec) -> usize {
    codec.payload_offset(&ChdrHeader::new(PacketType::DataWithTs))
}

/// In-memory receive link fed through a [`Sender`].
///
/// Frames pushed into the feeder end come out of [`RxLink::recv`] after
/// CHDR parsing. Used by loopback setups and tests.
#[derive(Debug)]
pub struct ChannelRxLink {
    codec: Codec,
    frames: Receiver<Bytes>,
    frame_size: usize,
}

/// Creates a [`ChannelRxLink`] and the feeder handle that pushes frames
/// into it.
pub fn channel_rx_link(codec: Codec, params: &LinkParams) -> (Sender<Bytes>, ChannelRxLink) {
    let (sender, receiver) = bounded(params.num_recv_frames);
    (
        sender,
        ChannelRxLink {
            codec,
            frames: receiver,
            frame_size: params.recv_frame_size,
        },
    )
}

impl RxLink for ChannelRxLink {
    fn recv(&mut self, timeout: Duration) -> Result<Option<RecvFrame>> {
        match self.frames.recv_timeout(timeout) {
            Ok(data) => {
                let info = self.codec.packet_info(&data)?;
                Ok(Some(RecvFrame { data, info }))
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn release_recv_buff(&mut self, frame: RecvFrame) {
        // Refcounted buffers return to the allocator on drop.
        drop(frame);
    }

    fn max_payload_size(&self) -> usize {
        self.frame_size - data_packet_overhead(&self.codec)
    }
}

/// In-memory transmit link delivering frames into a [`Receiver`].
#[derive(Debug)]
pub struct ChannelTxLink {
    codec: Codec,
    frames: Sender<Bytes>,
    status: Receiver<Bytes>,
    frame_size: usize,
}

/// Creates a [`ChannelTxLink`], the receiver that sees the transmitted
/// frames, and the feeder for inbound stream-status frames.
pub fn channel_tx_link(
    codec: Codec,
    params: &LinkParams,
) -> (ChannelTxLink, Receiver<Bytes>, Sender<Bytes>) {
    let (frame_tx, frame_rx) = bounded(params.num_send_frames);
    let (status_tx, status_rx) = bounded(params.num_send_frames);
    (
        ChannelTxLink {
            codec,
            frames: frame_tx,
            status: status_rx,
            frame_size: params.send_frame_size,
        },
        frame_rx,
        status_tx,
    )
}

impl TxLink for ChannelTxLink {
    fn acquire_send_buff(&mut self, timeout: Duration) -> Result<Option<SendFrame>> {
        let deadline = Instant::now() + timeout;
        while self.frames.is_full() {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        Ok(Some(SendFrame {
            data: BytesMut::zeroed(self.frame_size),
        }))
    }

    fn release_send_buff(&mut self, frame: SendFrame, len: usize) -> Result<()> {
        let mut data = frame.data;
        data.truncate(len);
        // The channel is bounded; a racing fill since acquire just blocks
        // here briefly.
        let _ = self.frames.send(data.freeze());
        Ok(())
    }

    fn try_recv_status(&mut self) -> Option<Bytes> {
        self.status.try_recv().ok()
    }

    fn max_payload_size(&self) -> usize {
        self.frame_size - data_packet_overhead(&self.codec)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vega_chdr::{ChdrWidth, Endianness};

    fn codec() -> Codec {
        Codec::new(ChdrWidth::W64, Endianness::Little)
    }

    #[test]
    fn rx_link_times_out_when_empty() {
        let (_feeder, mut link) = channel_rx_link(codec(), &LinkParams::default());
        assert!(link.recv(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    fn rx_link_parses_frames() {
        let (feeder, mut link) = channel_rx_link(codec(), &LinkParams::default());
        let mut buf = vec![0u8; 256];
        let mut header = ChdrHeader::new(PacketType::DataWithTs);
        header.seq_num = 5;
        let n = codec()
            .serialize_data(&header, Some(1234), &[], &[0u8; 16], &mut buf)
            .unwrap();
        feeder.send(Bytes::copy_from_slice(&buf[..n])).unwrap();
        let frame = link.recv(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(frame.info.seq_num, 5);
        assert_eq!(frame.info.tsf, 1234);
        assert_eq!(frame.info.payload_bytes, 16);
    }

    #[test]
    fn rx_link_flags_garbage() {
        let (feeder, mut link) = channel_rx_link(codec(), &LinkParams::default());
        feeder.send(Bytes::from_static(&[0xFF; 4])).unwrap();
        assert!(link.recv(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn tx_link_round_trip() {
        let (mut link, outbound, _status) = channel_tx_link(codec(), &LinkParams::default());
        let mut frame = link
            .acquire_send_buff(Duration::from_millis(10))
            .unwrap()
            .unwrap();
        frame.data[..4].copy_from_slice(&[1, 2, 3, 4]);
        link.release_send_buff(frame, 4).unwrap();
        assert_eq!(&outbound.try_recv().unwrap()[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn link_params_from_device_addr() {
        let addr: DeviceAddr = "recv_frame_size=1500,num_send_frames=8".parse().unwrap();
        let params = LinkParams::from_device_addr(&addr).unwrap();
        assert_eq!(params.recv_frame_size, 1500);
        assert_eq!(params.num_send_frames, 8);
        assert_eq!(params.num_recv_frames, LinkParams::default().num_recv_frames);
        assert_eq!(params.recv_buff_size, None);
        assert_eq!(params.send_buff_size, None);
    }

    #[test]
    fn buff_sizes_imply_frame_counts() {
        // Without explicit frame counts, the total buffer sizes say how
        // many frames fit.
        let addr: DeviceAddr = "recv_frame_size=2048,recv_buff_size=65536,send_buff_size=1000"
            .parse()
            .unwrap();
        let params = LinkParams::from_device_addr(&addr).unwrap();
        assert_eq!(params.recv_buff_size, Some(65536));
        assert_eq!(params.num_recv_frames, 32);
        // A buffer smaller than one frame still yields one frame.
        assert_eq!(params.send_buff_size, Some(1000));
        assert_eq!(params.num_send_frames, 1);

        // An explicit count wins over the buffer-derived one.
        let addr: DeviceAddr = "recv_buff_size=65536,num_recv_frames=4".parse().unwrap();
        let params = LinkParams::from_device_addr(&addr).unwrap();
        assert_eq!(params.num_recv_frames, 4);

        let addr: DeviceAddr = "recv_frame_size=0".parse().unwrap();
        assert!(LinkParams::from_device_addr(&addr).is_err());
    }
}
