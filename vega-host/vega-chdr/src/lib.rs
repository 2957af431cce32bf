//! vega-chdr is the codec for the CHDR data-plane protocol spoken between a
//! Vega host and the FPGA on a radio device. CHDR frames every packet on a
//! fixed bus width (64, 128, 256 or 512 bits) with a 64-bit header, an
//! optional 64-bit timestamp, optional metadata words and a payload. The
//! codec is stateless: a [`Codec`] value only carries the bus width and the
//! byte order of the device it talks to.
//!
//! The payload formats for control, stream-status and stream-command packets
//! live in the [`payload`] module. Data packet payloads are opaque to this
//! crate; [`Codec::packet_info`] extracts the framing information a transport
//! needs to hand a data packet to a streamer.

#![warn(missing_docs)]

pub mod payload;

use thiserror::Error;

/// Errors returned by the codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buffer does not contain a decodable packet, or a packet to be
    /// encoded violates a field-width constraint.
    #[error("malformed CHDR packet: {0}")]
    Malformed(String),
    /// The requested configuration is outside what CHDR allows.
    #[error("unsupported CHDR configuration: {0}")]
    Unsupported(String),
}

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// CHDR bus width in bits.
///
/// The bus width is a property of the FPGA image; all packets exchanged with
/// one device use the same width. The header always fits in the first 64 bits
/// of the first bus word.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChdrWidth {
    /// 64-bit bus.
    W64,
    /// 128-bit bus.
    W128,
    /// 256-bit bus.
    W256,
    /// 512-bit bus.
    W512,
}

impl ChdrWidth {
    /// Converts a width in bits into a [`ChdrWidth`].
    pub fn from_bits(bits: usize) -> Result<ChdrWidth> {
        match bits {
            64 => Ok(ChdrWidth::W64),
            128 => Ok(ChdrWidth::W128),
            256 => Ok(ChdrWidth::W256),
            512 => Ok(ChdrWidth::W512),
            _ => Err(Error::Unsupported(format!("bus width {bits} bits"))),
        }
    }

    /// Returns the width in bits.
    pub fn bits(self) -> usize {
        match self {
            ChdrWidth::W64 => 64,
            ChdrWidth::W128 => 128,
            ChdrWidth::W256 => 256,
            ChdrWidth::W512 => 512,
        }
    }

    /// Returns the size of one bus word in bytes.
    pub fn bytes(self) -> usize {
        self.bits() / 8
    }
}

/// Byte order of the CHDR stream on the transport.
///
/// FPGA images differ in byte order depending on the build, so this is a
/// run-time parameter of the codec rather than a compile-time one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Endianness {
    /// Little-endian 64-bit words.
    Little,
    /// Big-endian 64-bit words.
    Big,
}

/// CHDR packet type, a 3-bit field in the header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Management packet.
    Mgmt,
    /// Stream status (flow control feedback).
    StreamStatus,
    /// Stream command (flow control setup).
    StreamCmd,
    /// Control transaction.
    Ctrl,
    /// Data packet without timestamp.
    DataNoTs,
    /// Data packet with a 64-bit timestamp.
    DataWithTs,
}

impl PacketType {
    fn from_bits(bits: u64) -> Result<PacketType> {
        match bits {
            0x0 => Ok(PacketType::Mgmt),
            0x1 => Ok(PacketType::StreamStatus),
            0x2 => Ok(PacketType::StreamCmd),
            0x4 => Ok(PacketType::Ctrl),
            0x6 => Ok(PacketType::DataNoTs),
            0x7 => Ok(PacketType::DataWithTs),
            other => Err(Error::Malformed(format!("reserved packet type {other:#x}"))),
        }
    }

    fn bits(self) -> u64 {
        match self {
            PacketType::Mgmt => 0x0,
            PacketType::StreamStatus => 0x1,
            PacketType::StreamCmd => 0x2,
            PacketType::Ctrl => 0x4,
            PacketType::DataNoTs => 0x6,
            PacketType::DataWithTs => 0x7,
        }
    }

    /// Returns whether packets of this type carry a timestamp field.
    pub fn has_timestamp(self) -> bool {
        matches!(self, PacketType::DataWithTs)
    }
}

// Header word field offsets. The header is the first 64 bits of a packet.
const DST_EPID_OFFSET: u32 = 0;
const LENGTH_OFFSET: u32 = 16;
const SEQ_NUM_OFFSET: u32 = 32;
const NUM_MDATA_OFFSET: u32 = 48;
const PKT_TYPE_OFFSET: u32 = 53;
const EOV_OFFSET: u32 = 56;
const EOB_OFFSET: u32 = 57;
const VC_OFFSET: u32 = 58;

const NUM_MDATA_MAX: u8 = 0x1F;
const VC_MAX: u8 = 0x3F;

fn field(word: u64, offset: u32, width: u32) -> u64 {
    (word >> offset) & ((1u64 << width) - 1)
}

fn put(word: &mut u64, value: u64, offset: u32, width: u32) {
    let mask = ((1u64 << width) - 1) << offset;
    *word = (*word & !mask) | ((value << offset) & mask);
}

/// Parsed CHDR header, in host byte order.
///
/// `length` is the total packet length in bytes, counting the header word,
/// the timestamp (when present and when the bus is 64 bits wide), metadata
/// and payload. End of packet is always determined by `length`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChdrHeader {
    /// Virtual channel (6 bits).
    pub vc: u8,
    /// End of burst.
    pub eob: bool,
    /// End of vector.
    pub eov: bool,
    /// Packet type.
    pub pkt_type: PacketType,
    /// Number of metadata bus words following the header/timestamp (5 bits).
    pub num_mdata: u8,
    /// Packet sequence number.
    pub seq_num: u16,
    /// Total packet length in bytes.
    pub length: u16,
    /// Destination endpoint ID.
    pub dst_epid: u16,
}

impl ChdrHeader {
    /// Creates a header of the given type with all other fields zero.
    pub fn new(pkt_type: PacketType) -> ChdrHeader {
        ChdrHeader {
            vc: 0,
            eob: false,
            eov: false,
            pkt_type,
            num_mdata: 0,
            seq_num: 0,
            length: 0,
            dst_epid: 0,
        }
    }

    /// Packs the header into its 64-bit wire representation (host order).
    pub fn to_word(&self) -> u64 {
        let mut w = 0u64;
        put(&mut w, self.dst_epid as u64, DST_EPID_OFFSET, 16);
        put(&mut w, self.length as u64, LENGTH_OFFSET, 16);
        put(&mut w, self.seq_num as u64, SEQ_NUM_OFFSET, 16);
        put(&mut w, self.num_mdata as u64, NUM_MDATA_OFFSET, 5);
        put(&mut w, self.pkt_type.bits(), PKT_TYPE_OFFSET, 3);
        put(&mut w, self.eov as u64, EOV_OFFSET, 1);
        put(&mut w, self.eob as u64, EOB_OFFSET, 1);
        put(&mut w, self.vc as u64, VC_OFFSET, 6);
        w
    }

    /// Unpacks a 64-bit header word (host order).
    pub fn from_word(word: u64) -> Result<ChdrHeader> {
        Ok(ChdrHeader {
            vc: field(word, VC_OFFSET, 6) as u8,
            eob: field(word, EOB_OFFSET, 1) != 0,
            eov: field(word, EOV_OFFSET, 1) != 0,
            pkt_type: PacketType::from_bits(field(word, PKT_TYPE_OFFSET, 3))?,
            num_mdata: field(word, NUM_MDATA_OFFSET, 5) as u8,
            seq_num: field(word, SEQ_NUM_OFFSET, 16) as u16,
            length: field(word, LENGTH_OFFSET, 16) as u16,
            dst_epid: field(word, DST_EPID_OFFSET, 16) as u16,
        })
    }
}

/// Framing information of a data packet, as consumed by the link layer and
/// the streamers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PacketInfo {
    /// Whether the packet carries a timestamp.
    pub has_tsf: bool,
    /// The timestamp in device ticks (valid when `has_tsf`).
    pub tsf: u64,
    /// End of burst flag.
    pub eob: bool,
    /// End of vector flag.
    pub eov: bool,
    /// Byte offset of the payload within the frame buffer.
    pub payload_offset: usize,
    /// Payload length in bytes.
    pub payload_bytes: usize,
    /// Packet sequence number.
    pub seq_num: u16,
}

/// Stateless CHDR packet codec for one bus width and byte order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Codec {
    width: ChdrWidth,
    endianness: Endianness,
}

impl Codec {
    /// Creates a codec for the given bus width and byte order.
    pub fn new(width: ChdrWidth, endianness: Endianness) -> Codec {
        Codec { width, endianness }
    }

    /// Returns the configured bus width.
    pub fn width(&self) -> ChdrWidth {
        self.width
    }

    /// Returns the configured byte order.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Returns the size of one bus word in bytes.
    pub fn word_bytes(&self) -> usize {
        self.width.bytes()
    }

    fn read_u64(&self, buf: &[u8], offset: usize) -> u64 {
        let bytes: [u8; 8] = buf[offset..offset + 8].try_into().unwrap();
        match self.endianness {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => u64::from_be_bytes(bytes),
        }
    }

    fn write_u64(&self, buf: &mut [u8], offset: usize, value: u64) {
        let bytes = match self.endianness {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => value.to_be_bytes(),
        };
        buf[offset..offset + 8].copy_from_slice(&bytes);
    }

    /// Byte offset of the metadata for a packet with the given header.
    ///
    /// At 64-bit bus width the timestamp occupies word #1, so metadata of a
    /// timestamped packet starts at word #2. At wider bus widths the
    /// timestamp shares the first bus word with the header.
    pub fn metadata_offset(&self, header: &ChdrHeader) -> usize {
        let ts_words = if header.pkt_type.has_timestamp() && self.width == ChdrWidth::W64 {
            1
        } else {
            0
        };
        (1 + ts_words) * self.word_bytes()
    }

    /// Byte offset of the payload for a packet with the given header.
    pub fn payload_offset(&self, header: &ChdrHeader) -> usize {
        self.metadata_offset(header) + header.num_mdata as usize * self.word_bytes()
    }

    /// Parses and validates the header of the packet in `buf`.
    ///
    /// The packet is rejected as malformed if its declared length is shorter
    /// than its own framing overhead or longer than the buffer.
    pub fn parse_header(&self, buf: &[u8]) -> Result<ChdrHeader> {
        if buf.len() < 8 {
            return Err(Error::Malformed(format!(
                "buffer of {} bytes cannot hold a CHDR header",
                buf.len()
            )));
        }
        let header = ChdrHeader::from_word(self.read_u64(buf, 0))?;
        let length = header.length as usize;
        if length > buf.len() {
            return Err(Error::Malformed(format!(
                "declared length {} exceeds buffer of {} bytes",
                length,
                buf.len()
            )));
        }
        if length < self.payload_offset(&header) {
            return Err(Error::Malformed(format!(
                "declared length {} shorter than framing ({} bytes)",
                length,
                self.payload_offset(&header)
            )));
        }
        Ok(header)
    }

    /// Reads the timestamp of a `DataWithTs` packet.
    pub fn timestamp(&self, buf: &[u8]) -> u64 {
        self.read_u64(buf, 8)
    }

    /// Extracts the framing information of a data packet.
    ///
    /// Packets of any other type are rejected as malformed; the link layer
    /// routes those elsewhere.
    pub fn packet_info(&self, buf: &[u8]) -> Result<PacketInfo> {
        let header = self.parse_header(buf)?;
        if !matches!(header.pkt_type, PacketType::DataNoTs | PacketType::DataWithTs) {
            return Err(Error::Malformed(format!(
                "expected data packet, got {:?}",
                header.pkt_type
            )));
        }
        let payload_offset = self.payload_offset(&header);
        let has_tsf = header.pkt_type.has_timestamp();
        Ok(PacketInfo {
            has_tsf,
            tsf: if has_tsf { self.timestamp(buf) } else { 0 },
            eob: header.eob,
            eov: header.eov,
            payload_offset,
            payload_bytes: header.length as usize - payload_offset,
            seq_num: header.seq_num,
        })
    }

    /// Serializes a data packet into `buf` and returns the number of bytes
    /// written (the padded frame size).
    ///
    /// `header.pkt_type` must be one of the data types, with a timestamp
    /// provided exactly for `DataWithTs`. `mdata` must be a whole number of
    /// bus words and match `header.num_mdata`. The `length` field of the
    /// header is computed here; the value passed in is ignored.
    pub fn serialize_data(
        &self,
        header: &ChdrHeader,
        timestamp: Option<u64>,
        mdata: &[u8],
        data: &[u8],
        buf: &mut [u8],
    ) -> Result<usize> {
        match (header.pkt_type, timestamp) {
            (PacketType::DataWithTs, Some(_)) | (PacketType::DataNoTs, None) => {}
            (PacketType::DataWithTs, None) => {
                return Err(Error::Malformed("timestamped packet without timestamp".into()))
            }
            (PacketType::DataNoTs, Some(_)) => {
                return Err(Error::Malformed("timestamp on un-timestamped packet".into()))
            }
            (other, _) => {
                return Err(Error::Malformed(format!("{other:?} is not a data type")))
            }
        }
        if mdata.len() % self.word_bytes() != 0
            || mdata.len() / self.word_bytes() != header.num_mdata as usize
        {
            return Err(Error::Malformed(format!(
                "metadata of {} bytes does not match num_mdata {}",
                mdata.len(),
                header.num_mdata
            )));
        }
        let payload_offset = self.payload_offset(header);
        let length = payload_offset + data.len();
        self.finish_packet(header, length, buf, |codec, buf| {
            if let Some(ts) = timestamp {
                codec.write_u64(buf, 8, ts);
            }
            buf[payload_offset - mdata.len()..payload_offset].copy_from_slice(mdata);
            buf[payload_offset..payload_offset + data.len()].copy_from_slice(data);
            Ok(())
        })
    }

    /// Writes the header with the final `length`, zero-fills the frame up to
    /// the next bus-word boundary, and lets `fill` write the body.
    fn finish_packet<F>(
        &self,
        header: &ChdrHeader,
        length: usize,
        buf: &mut [u8],
        fill: F,
    ) -> Result<usize>
    where
        F: FnOnce(&Codec, &mut [u8]) -> Result<()>,
    {
        if length > u16::MAX as usize {
            return Err(Error::Malformed(format!("packet of {length} bytes overflows length field")));
        }
        let padded = length.div_ceil(self.word_bytes()) * self.word_bytes();
        if buf.len() < padded {
            return Err(Error::Malformed(format!(
                "frame buffer of {} bytes too small for {padded}-byte packet",
                buf.len()
            )));
        }
        let mut header = *header;
        header.length = length as u16;
        if header.num_mdata > NUM_MDATA_MAX || header.vc > VC_MAX {
            return Err(Error::Malformed("header field out of range".into()));
        }
        buf[..padded].fill(0);
        self.write_u64(buf, 0, header.to_word());
        fill(self, buf)?;
        Ok(padded)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn width_validation() {
        assert_eq!(ChdrWidth::from_bits(64).unwrap(), ChdrWidth::W64);
        assert_eq!(ChdrWidth::from_bits(512).unwrap(), ChdrWidth::W512);
        assert!(matches!(ChdrWidth::from_bits(32), Err(Error::Unsupported(_))));
        assert!(matches!(ChdrWidth::from_bits(1024), Err(Error::Unsupported(_))));
    }

    #[test]
    fn header_word_round_trip() {
        let header = ChdrHeader {
            vc: 0x2A,
            eob: true,
            eov: false,
            pkt_type: PacketType::DataWithTs,
            num_mdata: 3,
            seq_num: 0xBEEF,
            length: 0x1234,
            dst_epid: 0xCAFE,
        };
        assert_eq!(ChdrHeader::from_word(header.to_word()).unwrap(), header);
    }

    #[test]
    fn header_reserved_type_rejected() {
        let mut word = ChdrHeader::new(PacketType::DataNoTs).to_word();
        // Overwrite the packet type with the reserved value 3.
        put(&mut word, 0x3, PKT_TYPE_OFFSET, 3);
        assert!(matches!(ChdrHeader::from_word(word), Err(Error::Malformed(_))));
    }

    #[test]
    fn data_round_trip_all_widths() {
        let payload: Vec<u8> = (0..100u8).collect();
        for width in [ChdrWidth::W64, ChdrWidth::W128, ChdrWidth::W256, ChdrWidth::W512] {
            for endianness in [Endianness::Little, Endianness::Big] {
                let codec = Codec::new(width, endianness);
                let mut header = ChdrHeader::new(PacketType::DataWithTs);
                header.seq_num = 7;
                header.dst_epid = 2;
                header.eob = true;
                let mut buf = vec![0u8; 4096];
                let n = codec
                    .serialize_data(&header, Some(0x0102030405060708), &[], &payload, &mut buf)
                    .unwrap();
                assert_eq!(n % codec.word_bytes(), 0);
                let info = codec.packet_info(&buf[..n]).unwrap();
                assert!(info.has_tsf);
                assert_eq!(info.tsf, 0x0102030405060708);
                assert!(info.eob);
                assert_eq!(info.seq_num, 7);
                assert_eq!(info.payload_bytes, payload.len());
                assert_eq!(
                    &buf[info.payload_offset..info.payload_offset + info.payload_bytes],
                    &payload[..]
                );
            }
        }
    }

    #[test]
    fn timestamp_placement() {
        // At 64 bits the timestamp displaces the metadata by one word; at
        // wider widths it lives inside the first bus word.
        let mut header = ChdrHeader::new(PacketType::DataWithTs);
        header.num_mdata = 1;
        let w64 = Codec::new(ChdrWidth::W64, Endianness::Little);
        assert_eq!(w64.metadata_offset(&header), 16);
        assert_eq!(w64.payload_offset(&header), 24);
        let w256 = Codec::new(ChdrWidth::W256, Endianness::Little);
        assert_eq!(w256.metadata_offset(&header), 32);
        assert_eq!(w256.payload_offset(&header), 64);
    }

    #[test]
    fn truncated_and_oversized_packets_rejected() {
        let codec = Codec::new(ChdrWidth::W64, Endianness::Little);
        let header = ChdrHeader::new(PacketType::DataNoTs);
        let mut buf = vec![0u8; 256];
        let n = codec
            .serialize_data(&header, None, &[], &[1, 2, 3, 4], &mut buf)
            .unwrap();
        // Truncating the buffer below the declared length is malformed.
        assert!(matches!(codec.parse_header(&buf[..n - 8]), Err(Error::Malformed(_))));
        // A length shorter than the framing overhead is malformed.
        let mut bad = ChdrHeader::new(PacketType::DataWithTs);
        bad.length = 8;
        codec.write_u64(&mut buf, 0, bad.to_word());
        assert!(matches!(codec.parse_header(&buf), Err(Error::Malformed(_))));
    }

    #[test]
    fn reserved_header_bits_ignored() {
        // Parsers must accept packets with reserved bits set. The only
        // reserved encodings in the header are the packet type values, which
        // are checked separately; unknown flag combinations must pass.
        let codec = Codec::new(ChdrWidth::W64, Endianness::Little);
        let mut header = ChdrHeader::new(PacketType::DataNoTs);
        header.vc = VC_MAX;
        header.eov = true;
        let mut buf = vec![0u8; 64];
        let n = codec.serialize_data(&header, None, &[], &[0; 8], &mut buf).unwrap();
        let info = codec.packet_info(&buf[..n]).unwrap();
        assert!(info.eov);
    }
}
