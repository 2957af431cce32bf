//! Typed payloads of the non-data CHDR packet types.
//!
//! Control, stream-status and stream-command packets carry fixed bit layouts
//! in their payload. The layouts are packed little-endian within each 64-bit
//! word; the [`Codec`](crate::Codec) applies the transport byte order per
//! word on top. Reserved bits are zeroed when serializing and ignored when
//! parsing.

use crate::{ChdrHeader, Codec, Error, PacketType, Result};

/// Control transaction opcode (4 bits).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CtrlOpCode {
    Sleep,
    Write,
    Read,
    ReadModifyWrite,
    BlockWrite,
    BlockRead,
    Poll,
    User1,
    User2,
    User3,
    User4,
    User5,
    User6,
}

impl CtrlOpCode {
    fn from_bits(bits: u64) -> Result<CtrlOpCode> {
        Ok(match bits {
            0x0 => CtrlOpCode::Sleep,
            0x1 => CtrlOpCode::Write,
            0x2 => CtrlOpCode::Read,
            0x3 => CtrlOpCode::ReadModifyWrite,
            0x4 => CtrlOpCode::BlockWrite,
            0x5 => CtrlOpCode::BlockRead,
            0x6 => CtrlOpCode::Poll,
            0xA => CtrlOpCode::User1,
            0xB => CtrlOpCode::User2,
            0xC => CtrlOpCode::User3,
            0xD => CtrlOpCode::User4,
            0xE => CtrlOpCode::User5,
            0xF => CtrlOpCode::User6,
            other => return Err(Error::Malformed(format!("control opcode {other:#x}"))),
        })
    }

    fn bits(self) -> u64 {
        match self {
            CtrlOpCode::Sleep => 0x0,
            CtrlOpCode::Write => 0x1,
            CtrlOpCode::Read => 0x2,
            CtrlOpCode::ReadModifyWrite => 0x3,
            CtrlOpCode::BlockWrite => 0x4,
            CtrlOpCode::BlockRead => 0x5,
            CtrlOpCode::Poll => 0x6,
            CtrlOpCode::User1 => 0xA,
            CtrlOpCode::User2 => 0xB,
            CtrlOpCode::User3 => 0xC,
            CtrlOpCode::User4 => 0xD,
            CtrlOpCode::User5 => 0xE,
            CtrlOpCode::User6 => 0xF,
        }
    }
}

/// Control transaction completion status (2 bits).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CtrlStatus {
    Okay,
    CmdErr,
    TsErr,
    Warning,
}

impl CtrlStatus {
    fn from_bits(bits: u64) -> CtrlStatus {
        match bits & 0x3 {
            0 => CtrlStatus::Okay,
            1 => CtrlStatus::CmdErr,
            2 => CtrlStatus::TsErr,
            _ => CtrlStatus::Warning,
        }
    }

    fn bits(self) -> u64 {
        match self {
            CtrlStatus::Okay => 0,
            CtrlStatus::CmdErr => 1,
            CtrlStatus::TsErr => 2,
            CtrlStatus::Warning => 3,
        }
    }
}

/// Maximum number of 32-bit data words in one control transaction.
pub const CTRL_MAX_DATA_WORDS: usize = 6;

/// Payload of a control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlPayload {
    /// Destination control port within the endpoint (10 bits).
    pub dst_port: u16,
    /// Source control port (10 bits).
    pub src_port: u16,
    /// Transaction sequence number (6 bits).
    pub seq_num: u8,
    /// Whether this is an acknowledgement of a request.
    pub is_ack: bool,
    /// Endpoint ID of the sender.
    pub src_epid: u16,
    /// Register address (20 bits).
    pub address: u32,
    /// Byte enables for the addressed word (4 bits).
    pub byte_enable: u8,
    /// Operation code.
    pub op_code: CtrlOpCode,
    /// Completion status.
    pub status: CtrlStatus,
    /// Timestamp of a timed transaction.
    pub timestamp: Option<u64>,
    /// Transaction data, at most [`CTRL_MAX_DATA_WORDS`] words.
    pub data: Vec<u32>,
}

impl CtrlPayload {
    fn validate(&self) -> Result<()> {
        if self.dst_port > 0x3FF || self.src_port > 0x3FF {
            return Err(Error::Malformed("control port exceeds 10 bits".into()));
        }
        if self.seq_num > 0x3F {
            return Err(Error::Malformed("control seq_num exceeds 6 bits".into()));
        }
        if self.address > 0xF_FFFF {
            return Err(Error::Malformed("control address exceeds 20 bits".into()));
        }
        if self.byte_enable > 0xF {
            return Err(Error::Malformed("byte_enable exceeds 4 bits".into()));
        }
        if self.data.len() > CTRL_MAX_DATA_WORDS {
            return Err(Error::Malformed(format!(
                "control data vector of {} words exceeds {CTRL_MAX_DATA_WORDS}",
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Packs the payload into its 32-bit word stream.
    fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(4 + 2 + self.data.len());
        words.push(
            (self.dst_port as u32)
                | (self.src_port as u32) << 10
                | (self.data.len() as u32) << 20
                | (self.seq_num as u32) << 24
                | (self.timestamp.is_some() as u32) << 30
                | (self.is_ack as u32) << 31,
        );
        words.push(self.src_epid as u32);
        if let Some(ts) = self.timestamp {
            words.push(ts as u32);
            words.push((ts >> 32) as u32);
        }
        words.push(
            self.address
                | (self.byte_enable as u32) << 20
                | (self.op_code.bits() as u32) << 24
                | (self.status.bits() as u32) << 30,
        );
        words.extend_from_slice(&self.data);
        words
    }

    fn from_words(words: &[u32]) -> Result<CtrlPayload> {
        if words.len() < 3 {
            return Err(Error::Malformed("control payload truncated".into()));
        }
        let w0 = words[0];
        let num_data = (w0 >> 20 & 0xF) as usize;
        let has_time = w0 >> 30 & 1 != 0;
        if num_data > CTRL_MAX_DATA_WORDS {
            return Err(Error::Malformed(format!(
                "control data vector of {num_data} words exceeds {CTRL_MAX_DATA_WORDS}"
            )));
        }
        let expected = 2 + if has_time { 2 } else { 0 } + 1 + num_data;
        if words.len() < expected {
            return Err(Error::Malformed(format!(
                "control payload of {} words, need {expected}",
                words.len()
            )));
        }
        let mut next = 2;
        let timestamp = if has_time {
            let ts = words[next] as u64 | (words[next + 1] as u64) << 32;
            next += 2;
            Some(ts)
        } else {
            None
        };
        let op_word = words[next];
        next += 1;
        Ok(CtrlPayload {
            dst_port: (w0 & 0x3FF) as u16,
            src_port: (w0 >> 10 & 0x3FF) as u16,
            seq_num: (w0 >> 24 & 0x3F) as u8,
            is_ack: w0 >> 31 & 1 != 0,
            src_epid: words[1] as u16,
            address: op_word & 0xF_FFFF,
            byte_enable: (op_word >> 20 & 0xF) as u8,
            op_code: CtrlOpCode::from_bits((op_word >> 24 & 0xF) as u64)?,
            status: CtrlStatus::from_bits((op_word >> 30) as u64),
            timestamp,
            data: words[next..next + num_data].to_vec(),
        })
    }
}

/// Stream status flag (4 bits).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum StrsStatus {
    Okay,
    CmdErr,
    SeqErr,
    DataErr,
    RtErr,
}

impl StrsStatus {
    fn from_bits(bits: u64) -> Result<StrsStatus> {
        Ok(match bits {
            0 => StrsStatus::Okay,
            1 => StrsStatus::CmdErr,
            2 => StrsStatus::SeqErr,
            3 => StrsStatus::DataErr,
            4 => StrsStatus::RtErr,
            other => return Err(Error::Malformed(format!("stream status {other:#x}"))),
        })
    }

    fn bits(self) -> u64 {
        match self {
            StrsStatus::Okay => 0,
            StrsStatus::CmdErr => 1,
            StrsStatus::SeqErr => 2,
            StrsStatus::DataErr => 3,
            StrsStatus::RtErr => 4,
        }
    }
}

/// Payload of a stream-status packet (flow control feedback from a stream
/// endpoint).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct StrsPayload {
    /// Endpoint ID of the reporting endpoint.
    pub src_epid: u16,
    /// Condition being reported.
    pub status: StrsStatus,
    /// Downstream buffer capacity in bytes (40 bits).
    pub capacity_bytes: u64,
    /// Downstream buffer capacity in packets (24 bits).
    pub capacity_pkts: u32,
    /// Bytes transferred so far (64 bits).
    pub xfer_count_bytes: u64,
    /// Packets transferred so far (40 bits).
    pub xfer_count_pkts: u64,
    /// Buffer state summary (16 bits).
    pub buff_info: u16,
    /// Extended status detail (48 bits).
    pub status_info: u64,
}

impl Default for StrsStatus {
    fn default() -> StrsStatus {
        StrsStatus::Okay
    }
}

/// Stream-command opcode (4 bits).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum StrcOpCode {
    Init,
    Ping,
    Resync,
}

impl StrcOpCode {
    fn from_bits(bits: u64) -> Result<StrcOpCode> {
        Ok(match bits {
            0 => StrcOpCode::Init,
            1 => StrcOpCode::Ping,
            2 => StrcOpCode::Resync,
            other => return Err(Error::Malformed(format!("stream command opcode {other:#x}"))),
        })
    }

    fn bits(self) -> u64 {
        match self {
            StrcOpCode::Init => 0,
            StrcOpCode::Ping => 1,
            StrcOpCode::Resync => 2,
        }
    }
}

/// Payload of a stream-command packet (flow control setup towards a stream
/// endpoint).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StrcPayload {
    /// Endpoint ID of the sender.
    pub src_epid: u16,
    /// Operation to perform.
    pub op_code: StrcOpCode,
    /// Operation modifier (4 bits).
    pub op_data: u8,
    /// Packet count argument (40 bits).
    pub num_pkts: u64,
    /// Byte count argument (64 bits).
    pub num_bytes: u64,
}

impl Codec {
    /// Writes a 32-bit word stream after the packet framing, packing pairs of
    /// words into the 64-bit transport words.
    fn write_u32_stream(&self, buf: &mut [u8], offset: usize, words: &[u32]) {
        for (i, pair) in words.chunks(2).enumerate() {
            let lo = pair[0] as u64;
            let hi = if pair.len() == 2 { pair[1] as u64 } else { 0 };
            self.write_u64(buf, offset + i * 8, lo | hi << 32);
        }
    }

    fn read_u32_stream(&self, buf: &[u8], offset: usize, num_words: usize) -> Vec<u32> {
        let mut words = Vec::with_capacity(num_words);
        for i in 0..num_words.div_ceil(2) {
            let w = self.read_u64(buf, offset + i * 8);
            words.push(w as u32);
            if words.len() < num_words {
                words.push((w >> 32) as u32);
            }
        }
        words
    }

    fn parse_typed_header(&self, buf: &[u8], pkt_type: PacketType) -> Result<ChdrHeader> {
        let header = self.parse_header(buf)?;
        if header.pkt_type != pkt_type {
            return Err(Error::Malformed(format!(
                "expected {:?} packet, got {:?}",
                pkt_type, header.pkt_type
            )));
        }
        Ok(header)
    }

    /// Serializes a control packet and returns the padded frame size.
    ///
    /// `header.pkt_type` is forced to [`PacketType::Ctrl`] and the length
    /// field is computed here.
    pub fn serialize_ctrl(
        &self,
        header: &ChdrHeader,
        payload: &CtrlPayload,
        buf: &mut [u8],
    ) -> Result<usize> {
        payload.validate()?;
        let mut header = *header;
        header.pkt_type = PacketType::Ctrl;
        let payload_offset = self.payload_offset(&header);
        let words = payload.to_words();
        let length = payload_offset + words.len() * 4;
        self.finish_packet(&header, length, buf, |codec, buf| {
            codec.write_u32_stream(buf, payload_offset, &words);
            Ok(())
        })
    }

    /// Parses a control packet.
    pub fn parse_ctrl(&self, buf: &[u8]) -> Result<(ChdrHeader, CtrlPayload)> {
        let header = self.parse_typed_header(buf, PacketType::Ctrl)?;
        let payload_offset = self.payload_offset(&header);
        let num_words = (header.length as usize - payload_offset) / 4;
        // An odd word count still occupies a full 64-bit word on the wire.
        if buf.len() < payload_offset + num_words.div_ceil(2) * 8 {
            return Err(Error::Malformed("control payload truncated".into()));
        }
        let words = self.read_u32_stream(buf, payload_offset, num_words);
        Ok((header, CtrlPayload::from_words(&words)?))
    }

    /// Serializes a stream-status packet and returns the padded frame size.
    pub fn serialize_strs(
        &self,
        header: &ChdrHeader,
        payload: &StrsPayload,
        buf: &mut [u8],
    ) -> Result<usize> {
        if payload.capacity_bytes >> 40 != 0
            || payload.capacity_pkts >> 24 != 0
            || payload.xfer_count_pkts >> 40 != 0
            || payload.status_info >> 48 != 0
        {
            return Err(Error::Malformed("stream status field out of range".into()));
        }
        let mut header = *header;
        header.pkt_type = PacketType::StreamStatus;
        let offset = self.payload_offset(&header);
        let length = offset + 4 * 8;
        self.finish_packet(&header, length, buf, |codec, buf| {
            codec.write_u64(
                buf,
                offset,
                payload.src_epid as u64 | payload.status.bits() << 16 | payload.capacity_bytes << 24,
            );
            codec.write_u64(
                buf,
                offset + 8,
                payload.capacity_pkts as u64 | payload.xfer_count_pkts << 24,
            );
            codec.write_u64(buf, offset + 16, payload.xfer_count_bytes);
            codec.write_u64(
                buf,
                offset + 24,
                payload.buff_info as u64 | payload.status_info << 16,
            );
            Ok(())
        })
    }

    /// Parses a stream-status packet.
    pub fn parse_strs(&self, buf: &[u8]) -> Result<(ChdrHeader, StrsPayload)> {
        let header = self.parse_typed_header(buf, PacketType::StreamStatus)?;
        let offset = self.payload_offset(&header);
        if header.length as usize - offset < 4 * 8 {
            return Err(Error::Malformed("stream status payload truncated".into()));
        }
        let w0 = self.read_u64(buf, offset);
        let w1 = self.read_u64(buf, offset + 8);
        let w3 = self.read_u64(buf, offset + 24);
        Ok((
            header,
            StrsPayload {
                src_epid: w0 as u16,
                status: StrsStatus::from_bits(w0 >> 16 & 0xF)?,
                capacity_bytes: w0 >> 24,
                capacity_pkts: (w1 & 0xFF_FFFF) as u32,
                xfer_count_pkts: w1 >> 24,
                xfer_count_bytes: self.read_u64(buf, offset + 16),
                buff_info: w3 as u16,
                status_info: w3 >> 16,
            },
        ))
    }

    /// Serializes a stream-command packet and returns the padded frame size.
    pub fn serialize_strc(
        &self,
        header: &ChdrHeader,
        payload: &StrcPayload,
        buf: &mut [u8],
    ) -> Result<usize> {
        if payload.op_data > 0xF || payload.num_pkts >> 40 != 0 {
            return Err(Error::Malformed("stream command field out of range".into()));
        }
        let mut header = *header;
        header.pkt_type = PacketType::StreamCmd;
        let offset = self.payload_offset(&header);
        let length = offset + 2 * 8;
        self.finish_packet(&header, length, buf, |codec, buf| {
            codec.write_u64(
                buf,
                offset,
                payload.src_epid as u64
                    | payload.op_code.bits() << 16
                    | (payload.op_data as u64) << 20
                    | payload.num_pkts << 24,
            );
            codec.write_u64(buf, offset + 8, payload.num_bytes);
            Ok(())
        })
    }

    /// Parses a stream-command packet.
    pub fn parse_strc(&self, buf: &[u8]) -> Result<(ChdrHeader, StrcPayload)> {
        let header = self.parse_typed_header(buf, PacketType::StreamCmd)?;
        let offset = self.payload_offset(&header);
        if header.length as usize - offset < 2 * 8 {
            return Err(Error::Malformed("stream command payload truncated".into()));
        }
        let w0 = self.read_u64(buf, offset);
        Ok((
            header,
            StrcPayload {
                src_epid: w0 as u16,
                op_code: StrcOpCode::from_bits(w0 >> 16 & 0xF)?,
                op_data: (w0 >> 20 & 0xF) as u8,
                num_pkts: w0 >> 24,
                num_bytes: self.read_u64(buf, offset + 8),
            },
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ChdrWidth, Endianness};

    fn example_ctrl() -> CtrlPayload {
        CtrlPayload {
            dst_port: 0x321,
            src_port: 0x0AA,
            seq_num: 0x15,
            is_ack: true,
            src_epid: 0xBEEF,
            address: 0x4_2000,
            byte_enable: 0xF,
            op_code: CtrlOpCode::Write,
            status: CtrlStatus::Okay,
            timestamp: Some(0x1234_5678_90AB_CDEF),
            data: vec![0xDEAD_BEEF],
        }
    }

    /// Swaps every 64-bit word of a frame, converting between the two
    /// transport byte orders.
    fn byte_swap_words(buf: &mut [u8]) {
        for word in buf.chunks_mut(8) {
            word.reverse();
        }
    }

    #[test]
    fn ctrl_round_trip_w256_big_endian() {
        let codec = Codec::new(ChdrWidth::W256, Endianness::Big);
        let mut header = ChdrHeader::new(PacketType::Ctrl);
        header.seq_num = 3;
        header.dst_epid = 0x10;
        let payload = example_ctrl();
        let mut buf = vec![0u8; 512];
        let n = codec.serialize_ctrl(&header, &payload, &mut buf).unwrap();
        assert_eq!(n % 32, 0);
        let (parsed_header, parsed) = codec.parse_ctrl(&buf[..n]).unwrap();
        assert_eq!(parsed_header.seq_num, 3);
        assert_eq!(parsed_header.dst_epid, 0x10);
        assert_eq!(parsed, payload);

        // Swapping the words turns the frame into its little-endian twin.
        byte_swap_words(&mut buf[..n]);
        let codec_le = Codec::new(ChdrWidth::W256, Endianness::Little);
        let (_, parsed_le) = codec_le.parse_ctrl(&buf[..n]).unwrap();
        assert_eq!(parsed_le, payload);
    }

    #[test]
    fn ctrl_round_trip_all_widths() {
        let mut payload = example_ctrl();
        payload.timestamp = None;
        payload.data = vec![1, 2, 3, 4, 5, 6];
        for width in [ChdrWidth::W64, ChdrWidth::W128, ChdrWidth::W256, ChdrWidth::W512] {
            for endianness in [Endianness::Little, Endianness::Big] {
                let codec = Codec::new(width, endianness);
                let header = ChdrHeader::new(PacketType::Ctrl);
                let mut buf = vec![0u8; 512];
                let n = codec.serialize_ctrl(&header, &payload, &mut buf).unwrap();
                let (_, parsed) = codec.parse_ctrl(&buf[..n]).unwrap();
                assert_eq!(parsed, payload);
            }
        }
    }

    #[test]
    fn ctrl_data_vector_bounded() {
        let codec = Codec::new(ChdrWidth::W64, Endianness::Little);
        let mut payload = example_ctrl();
        payload.data = vec![0; 7];
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            codec.serialize_ctrl(&ChdrHeader::new(PacketType::Ctrl), &payload, &mut buf),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn strs_round_trip() {
        let payload = StrsPayload {
            src_epid: 0x00AB,
            status: StrsStatus::SeqErr,
            capacity_bytes: 0xFF_FFFF_FFFF,
            capacity_pkts: 0xABCDEF,
            xfer_count_bytes: 0x0123_4567_89AB_CDEF,
            xfer_count_pkts: 0x12_3456_7890,
            buff_info: 0x5A5A,
            status_info: 0xFFFF_FFFF_FFFF,
        };
        for endianness in [Endianness::Little, Endianness::Big] {
            let codec = Codec::new(ChdrWidth::W128, endianness);
            let mut buf = vec![0u8; 256];
            let n = codec
                .serialize_strs(&ChdrHeader::new(PacketType::StreamStatus), &payload, &mut buf)
                .unwrap();
            let (_, parsed) = codec.parse_strs(&buf[..n]).unwrap();
            assert_eq!(parsed, payload);
        }
    }

    #[test]
    fn strc_round_trip() {
        let payload = StrcPayload {
            src_epid: 0x1234,
            op_code: StrcOpCode::Init,
            op_data: 0x5,
            num_pkts: 0x80_0000_0001,
            num_bytes: u64::MAX,
        };
        let codec = Codec::new(ChdrWidth::W64, Endianness::Big);
        let mut buf = vec![0u8; 256];
        let n = codec
            .serialize_strc(&ChdrHeader::new(PacketType::StreamCmd), &payload, &mut buf)
            .unwrap();
        let (_, parsed) = codec.parse_strc(&buf[..n]).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn strs_field_ranges_enforced() {
        let codec = Codec::new(ChdrWidth::W64, Endianness::Little);
        let payload = StrsPayload {
            capacity_bytes: 1 << 40,
            ..Default::default()
        };
        let mut buf = vec![0u8; 256];
        assert!(matches!(
            codec.serialize_strs(&ChdrHeader::new(PacketType::StreamStatus), &payload, &mut buf),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn type_confusion_rejected() {
        let codec = Codec::new(ChdrWidth::W64, Endianness::Little);
        let mut buf = vec![0u8; 256];
        let n = codec
            .serialize_strc(
                &ChdrHeader::new(PacketType::StreamCmd),
                &StrcPayload {
                    src_epid: 1,
                    op_code: StrcOpCode::Ping,
                    op_data: 0,
                    num_pkts: 0,
                    num_bytes: 0,
                },
                &mut buf,
            )
            .unwrap();
        assert!(matches!(codec.parse_ctrl(&buf[..n]), Err(Error::Malformed(_))));
        assert!(matches!(codec.packet_info(&buf[..n]), Err(Error::Malformed(_))));
    }
}
