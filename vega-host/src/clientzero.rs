//! The device info endpoint.
//!
//! Every device exposes a fixed control endpoint, reachable on port 0, that
//! describes what is on the FPGA: how many transports, blocks and stream
//! endpoints exist, how the blocks are wired together, and per-port flush
//! and reset controls. This is the only part of the runtime that talks to
//! device registers directly; everything above works on graph nodes.

use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// Synchronous 32-bit register access on one control endpoint.
pub trait RegisterIface: Send {
    /// Reads a register.
    fn peek32(&mut self, addr: u32) -> Result<u32>;

    /// Writes a register.
    fn poke32(&mut self, addr: u32, value: u32) -> Result<()>;

    /// Reads `len` consecutive registers starting at `addr`.
    fn block_peek32(&mut self, addr: u32, len: usize) -> Result<Vec<u32>> {
        (0..len).map(|i| self.peek32(addr + 4 * i as u32)).collect()
    }
}

// Global register addresses.
const PROTOVER_ADDR: u32 = 0;
const PORT_CNT_ADDR: u32 = 4;
const EDGE_CNT_ADDR: u32 = 8;
const DEVICE_INFO_ADDR: u32 = 12;
// Per-port write registers: flush timeout at offset 0, flush/reset bits at
// offset 4.
const FLUSH_RESET_OFFSET: u32 = 4;
// Per-port read registers: config at offset 0, NOC ID at offset 4, flush
// status and data config at offset 8.
const NOC_ID_OFFSET: u32 = 4;
const STATUS_OFFSET: u32 = 8;

const ADJACENCY_BASE_ADDR: u32 = 0x1_0000;
const REGS_PER_PORT: u32 = 16;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);
const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(10);
// Hardware-timed flush timeout, in cycles.
const DEFAULT_FLUSH_TIMEOUT: u32 = 100;

/// One entry of the on-device adjacency list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EdgeDef {
    /// Source block index.
    pub src_blk: u16,
    /// Source port.
    pub src_port: u8,
    /// Destination block index.
    pub dst_blk: u16,
    /// Destination port.
    pub dst_port: u8,
}

/// Static configuration of one block port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockConfigInfo {
    /// Number of data input ports.
    pub num_data_in: u8,
    /// Number of data output ports.
    pub num_data_out: u8,
    /// Control FIFO depth, log2 words.
    pub ctrl_fifo_size: u8,
    /// Maximum outstanding asynchronous messages.
    pub ctrl_max_async_msgs: u8,
    /// Block protocol version.
    pub noc_protover: u8,
    /// Data MTU, log2 CHDR words.
    pub data_mtu: u8,
}

/// Client of the device info endpoint.
///
/// The static information is read once at construction; flush and reset are
/// live register operations.
pub struct ClientZero {
    regs: Box<dyn RegisterIface>,
    proto_ver: u16,
    device_type: u16,
    has_chdr_crossbar: bool,
    num_transports: u16,
    num_blocks: u16,
    num_stream_endpoints: u16,
    num_edges: u32,
    adjacency: Vec<EdgeDef>,
}

impl ClientZero {
    /// Reads the device description from the endpoint's registers.
    pub fn new(mut regs: Box<dyn RegisterIface>) -> Result<ClientZero> {
        let proto_reg = regs.peek32(PROTOVER_ADDR)?;
        let port_reg = regs.peek32(PORT_CNT_ADDR)?;
        let edge_reg = regs.peek32(EDGE_CNT_ADDR)?;
        let device_info_reg = regs.peek32(DEVICE_INFO_ADDR)?;

        let mut client = ClientZero {
            regs,
            proto_ver: (proto_reg & 0xFFFF) as u16,
            has_chdr_crossbar: port_reg & (1 << 31) != 0,
            num_transports: ((port_reg >> 20) & 0x3FF) as u16,
            num_blocks: ((port_reg >> 10) & 0x3FF) as u16,
            num_stream_endpoints: (port_reg & 0x3FF) as u16,
            num_edges: edge_reg,
            device_type: ((device_info_reg >> 16) & 0xFFFF) as u16,
            adjacency: Vec::new(),
        };
        client.adjacency = client.read_adjacency_list()?;

        // Give every block a sane hardware flush timeout up front.
        for portno in client.block_ports() {
            client.set_flush_timeout(DEFAULT_FLUSH_TIMEOUT, portno)?;
        }
        Ok(client)
    }

    fn read_adjacency_list(&mut self) -> Result<Vec<EdgeDef>> {
        let num_entries = (self.regs.peek32(ADJACENCY_BASE_ADDR)? & 0x3FFF) as usize;
        let raw = self.regs.block_peek32(ADJACENCY_BASE_ADDR + 4, num_entries)?;
        Ok(raw
            .into_iter()
            .map(|entry| EdgeDef {
                src_blk: ((entry >> 22) & 0x3FF) as u16,
                src_port: ((entry >> 16) & 0x3F) as u8,
                dst_blk: ((entry >> 6) & 0x3FF) as u16,
                dst_port: (entry & 0x3F) as u8,
            })
            .collect())
    }

    /// Protocol version of the device.
    pub fn proto_ver(&self) -> u16 {
        self.proto_ver
    }

    /// Numeric device type.
    pub fn device_type(&self) -> u16 {
        self.device_type
    }

    /// Whether the device routes CHDR through a crossbar.
    pub fn has_chdr_crossbar(&self) -> bool {
        self.has_chdr_crossbar
    }

    /// Number of transports.
    pub fn num_transports(&self) -> u16 {
        self.num_transports
    }

    /// Number of processing blocks.
    pub fn num_blocks(&self) -> u16 {
        self.num_blocks
    }

    /// Number of stream endpoints.
    pub fn num_stream_endpoints(&self) -> u16 {
        self.num_stream_endpoints
    }

    /// Number of static edges between blocks.
    pub fn num_edges(&self) -> u32 {
        self.num_edges
    }

    /// The static connections between the on-device blocks.
    pub fn adjacency_list(&self) -> &[EdgeDef] {
        &self.adjacency
    }

    /// The port numbers occupied by blocks. Port 0 is this endpoint and the
    /// next `num_stream_endpoints` ports are stream endpoints; blocks come
    /// after that.
    pub fn block_ports(&self) -> std::ops::Range<u16> {
        let first = 1 + self.num_stream_endpoints;
        first..first + self.num_blocks
    }

    /// Reads the NOC ID that identifies the block type on a port.
    pub fn noc_id(&mut self, portno: u16) -> Result<u32> {
        self.check_port_number(portno)?;
        self.regs.peek32(port_base_addr(portno) + NOC_ID_OFFSET)
    }

    /// Reads the static block configuration of a port.
    pub fn block_info(&mut self, portno: u16) -> Result<BlockConfigInfo> {
        self.check_port_number(portno)?;
        let config = self.regs.peek32(port_base_addr(portno))?;
        let data = self.regs.peek32(port_base_addr(portno) + STATUS_OFFSET)?;
        Ok(BlockConfigInfo {
            num_data_in: (config & 0x3F) as u8,
            num_data_out: ((config >> 6) & 0x3F) as u8,
            ctrl_fifo_size: ((config >> 12) & 0x3F) as u8,
            ctrl_max_async_msgs: ((config >> 18) & 0x3F) as u8,
            noc_protover: ((config >> 24) & 0xFF) as u8,
            data_mtu: ((data >> 2) & 0x3F) as u8,
        })
    }

    /// Whether a flush is in progress on a port.
    pub fn flush_active(&mut self, portno: u16) -> Result<bool> {
        Ok(self.flush_status_flags(portno)? & 1 != 0)
    }

    /// Whether the last requested flush has completed.
    pub fn flush_done(&mut self, portno: u16) -> Result<bool> {
        Ok(self.flush_status_flags(portno)? & (1 << 1) != 0)
    }

    /// Polls `flush_done` until it reads true or `timeout` elapses.
    pub fn poll_flush_done(&mut self, portno: u16, timeout: Duration) -> Result<bool> {
        self.check_port_number(portno)?;
        let deadline = Instant::now() + timeout;
        while !self.flush_done(portno)? {
            if Instant::now() > deadline {
                return Ok(false);
            }
            std::thread::sleep(DEFAULT_POLL_PERIOD);
        }
        Ok(true)
    }

    /// Sets the hardware flush timeout of a port, in cycles.
    pub fn set_flush_timeout(&mut self, timeout: u32, portno: u16) -> Result<()> {
        self.check_port_number(portno)?;
        self.regs.poke32(port_base_addr(portno), timeout)
    }

    /// Starts a flush on a port.
    pub fn set_flush(&mut self, portno: u16) -> Result<()> {
        self.check_port_number(portno)?;
        self.regs.poke32(port_base_addr(portno) + FLUSH_RESET_OFFSET, 1)
    }

    /// Flushes a port and waits for completion.
    pub fn complete_flush(&mut self, portno: u16) -> Result<bool> {
        self.set_flush(portno)?;
        self.poll_flush_done(portno, DEFAULT_POLL_TIMEOUT)
    }

    /// Pulses the control-path reset of a port.
    pub fn reset_ctrl(&mut self, portno: u16) -> Result<()> {
        self.check_port_number(portno)?;
        self.regs.poke32(port_base_addr(portno) + FLUSH_RESET_OFFSET, 1 << 1)?;
        std::thread::sleep(Duration::from_micros(100));
        self.regs.poke32(port_base_addr(portno) + FLUSH_RESET_OFFSET, 1 << 1)
    }

    /// Pulses the CHDR-path reset of a port.
    pub fn reset_chdr(&mut self, portno: u16) -> Result<()> {
        self.check_port_number(portno)?;
        self.regs.poke32(port_base_addr(portno) + FLUSH_RESET_OFFSET, 1 << 2)?;
        std::thread::sleep(Duration::from_millis(1));
        self.regs.poke32(port_base_addr(portno) + FLUSH_RESET_OFFSET, 1 << 2)
    }

    fn flush_status_flags(&mut self, portno: u16) -> Result<u32> {
        self.check_port_number(portno)?;
        self.regs.peek32(port_base_addr(portno) + STATUS_OFFSET)
    }

    /// Block ports come after the stream endpoints; querying anything else
    /// is a caller bug.
    fn check_port_number(&self, portno: u16) -> Result<()> {
        let num_ports = 1 + self.num_stream_endpoints + self.num_blocks;
        if portno >= num_ports {
            return Err(Error::Lookup(format!(
                "port {portno} is beyond the {num_ports} device ports"
            )));
        }
        if portno <= self.num_stream_endpoints {
            return Err(Error::Lookup(format!(
                "port {portno} is not a block port"
            )));
        }
        Ok(())
    }
}

fn port_base_addr(portno: u16) -> u32 {
    REGS_PER_PORT * portno as u32 * 4
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    use std::sync::{Arc, Mutex};

    /// Register file backed by a map, with a poke journal shared with the
    /// test.
    struct MockRegIface {
        regs: HashMap<u32, u32>,
        pokes: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl MockRegIface {
        /// A device with 1 transport, 2 stream endpoints and 2 blocks.
        fn device() -> MockRegIface {
            let mut regs = HashMap::new();
            regs.insert(PROTOVER_ADDR, 0x0100);
            regs.insert(PORT_CNT_ADDR, (1 << 31) | (1 << 20) | (2 << 10) | 2);
            regs.insert(EDGE_CNT_ADDR, 2);
            regs.insert(DEVICE_INFO_ADDR, 0xA500 << 16);
            // Two adjacency entries: 2:0 -> 3:0 and 3:0 -> 2:1.
            regs.insert(ADJACENCY_BASE_ADDR, 2);
            regs.insert(ADJACENCY_BASE_ADDR + 4, (2 << 22) | (3 << 6));
            regs.insert(ADJACENCY_BASE_ADDR + 8, (3 << 22) | (2 << 6) | 1);
            // Block on port 3: 2 in, 2 out, fifo 5, async 1, protover 1,
            // MTU 10.
            regs.insert(port_base_addr(3), 2 | (2 << 6) | (5 << 12) | (1 << 18) | (1 << 24));
            regs.insert(port_base_addr(3) + NOC_ID_OFFSET, 0xDDC0_0000);
            regs.insert(port_base_addr(3) + STATUS_OFFSET, 10 << 2);
            MockRegIface {
                regs,
                pokes: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn journal(&self) -> Arc<Mutex<Vec<(u32, u32)>>> {
            Arc::clone(&self.pokes)
        }
    }

    impl RegisterIface for MockRegIface {
        fn peek32(&mut self, addr: u32) -> Result<u32> {
            Ok(*self.regs.get(&addr).unwrap_or(&0))
        }

        fn poke32(&mut self, addr: u32, value: u32) -> Result<()> {
            self.pokes.lock().unwrap().push((addr, value));
            self.regs.insert(addr, value);
            Ok(())
        }
    }

    #[test]
    fn device_description_is_parsed() {
        let client = ClientZero::new(Box::new(MockRegIface::device())).unwrap();
        assert_eq!(client.proto_ver(), 0x0100);
        assert!(client.has_chdr_crossbar());
        assert_eq!(client.num_transports(), 1);
        assert_eq!(client.num_blocks(), 2);
        assert_eq!(client.num_stream_endpoints(), 2);
        assert_eq!(client.num_edges(), 2);
        assert_eq!(client.device_type(), 0xA500);
        assert_eq!(client.block_ports(), 3..5);
        assert_eq!(
            client.adjacency_list(),
            &[
                EdgeDef {
                    src_blk: 2,
                    src_port: 0,
                    dst_blk: 3,
                    dst_port: 0
                },
                EdgeDef {
                    src_blk: 3,
                    src_port: 0,
                    dst_blk: 2,
                    dst_port: 1
                },
            ]
        );
    }

    #[test]
    fn block_info_and_noc_id() {
        let mut client = ClientZero::new(Box::new(MockRegIface::device())).unwrap();
        assert_eq!(client.noc_id(3).unwrap(), 0xDDC0_0000);
        let info = client.block_info(3).unwrap();
        assert_eq!(info.num_data_in, 2);
        assert_eq!(info.num_data_out, 2);
        assert_eq!(info.ctrl_fifo_size, 5);
        assert_eq!(info.ctrl_max_async_msgs, 1);
        assert_eq!(info.noc_protover, 1);
        assert_eq!(info.data_mtu, 10);
    }

    #[test]
    fn stream_endpoint_ports_are_rejected() {
        let mut client = ClientZero::new(Box::new(MockRegIface::device())).unwrap();
        // Port 0 is this endpoint, ports 1..=2 are stream endpoints,
        // port 5 is beyond the device.
        for portno in [0, 1, 2, 5] {
            assert!(matches!(client.noc_id(portno), Err(Error::Lookup(_))));
        }
    }

    #[test]
    fn flush_polls_until_done() {
        let mut regs = MockRegIface::device();
        // flush_done is bit 1 of the status register.
        regs.regs.insert(port_base_addr(4) + STATUS_OFFSET, 1 << 1);
        let mut client = ClientZero::new(Box::new(regs)).unwrap();
        assert!(client.complete_flush(4).unwrap());
        // Port 3 never reports done; the poll gives up.
        assert!(!client
            .poll_flush_done(3, Duration::from_millis(30))
            .unwrap());
    }

    #[test]
    fn resets_pulse_their_bits() {
        let regs = MockRegIface::device();
        let journal = regs.journal();
        let mut client = ClientZero::new(Box::new(regs)).unwrap();
        journal.lock().unwrap().clear(); // drop the constructor's pokes
        client.reset_ctrl(3).unwrap();
        client.reset_chdr(3).unwrap();
        let reset_addr = port_base_addr(3) + FLUSH_RESET_OFFSET;
        assert_eq!(
            journal.lock().unwrap().as_slice(),
            &[
                (reset_addr, 1 << 1),
                (reset_addr, 1 << 1),
                (reset_addr, 1 << 2),
                (reset_addr, 1 << 2),
            ]
        );
    }
}
