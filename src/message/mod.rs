//! Length-prefixed message framing over byte streams.
//!
//! A frame is a variable-length header encoding the payload length followed
//! by the payload bytes:
//!
//! ```text
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +--------------+-------------------------------+---------------+
//! |Payload Length|    Extended Payload Length    | Ext. Length   |
//! |     (8)      |            (16/56)            | continued ... |
//! |              | (if payload length==254/255)  | if len == 255 |
//! +--------------+ - - - - - - - - - - - - - - - - - - - - - - - +
//! |   Extended payload length continued, if payload len == 255   |
//! | - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - -+
//! |                        Payload Data                          |
//! +--------------------------------------------------------------+
//! ```
//!
//! A first byte of 0..=253 is the payload length itself; 254 means the next
//! 2 bytes carry a 16-bit length; 255 means the next 7 bytes carry a 56-bit
//! length. Multibyte lengths use the configured byte order (network order by
//! default). Boundary-preserving transports (datagram, seqpacket) pass
//! payloads through without a header.

mod pipe;
pub use pipe::{message_pipe, PipeReader, PipeWriter};

use crate::errors::{Error, Result};
use crate::sync::spin::{Level, SpinWait, SpinWaiter};
use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

const HEADER_LEN: u64 = 1;
const MAX_PAYLOAD_8: u64 = (1 << 8) - 3;
const MAX_PAYLOAD_16: u64 = (1 << 16) - 1;
const MAX_PAYLOAD_56: u64 = (1 << 56) - 1;

const STATUS_READ: u32 = 4;
const STATUS_WRITE: u32 = 2;
const STATUS_CLOSED: u32 = 0x2000;

/// Byte order of the 2- and 7-byte extended length fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Network order, the default.
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    pub fn put_u16(self, buf: &mut [u8], v: u16) {
        let bytes = match self {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        };
        buf[..2].copy_from_slice(&bytes);
    }

    pub fn get_u16(self, buf: &[u8]) -> u16 {
        let bytes = [buf[0], buf[1]];
        match self {
            ByteOrder::Big => u16::from_be_bytes(bytes),
            ByteOrder::Little => u16::from_le_bytes(bytes),
        }
    }

    pub fn put_u64(self, buf: &mut [u8; 8], v: u64) {
        *buf = match self {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        };
    }

    pub fn get_u64(self, buf: &[u8; 8]) -> u64 {
        match self {
            ByteOrder::Big => u64::from_be_bytes(*buf),
            ByteOrder::Little => u64::from_le_bytes(*buf),
        }
    }
}

/// Semantic class of the transport under a framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnderlyingProtocol {
    Stream = 1,
    Dgram = 2,
    SeqPacket = 5,
}

impl UnderlyingProtocol {
    /// True if the transport already preserves message boundaries, in which
    /// case the framer adds no header.
    pub const fn preserve_boundary(self) -> bool {
        matches!(self, UnderlyingProtocol::Dgram | UnderlyingProtocol::SeqPacket)
    }
}

/// Message feature options.
#[derive(Debug, Clone, Copy)]
pub struct MessageOptions {
    pub read_byte_order: ByteOrder,
    pub write_byte_order: ByteOrder,
    pub read_proto: UnderlyingProtocol,
    pub write_proto: UnderlyingProtocol,
    /// Maximum accepted payload length on read; zero means no limit.
    pub read_limit: u64,
    /// When true, message operations never block on I/O or on a contended
    /// reader/writer slot.
    pub nonblock: bool,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            read_byte_order: ByteOrder::Big,
            write_byte_order: ByteOrder::Big,
            read_proto: UnderlyingProtocol::Stream,
            write_proto: UnderlyingProtocol::Stream,
            read_limit: 0,
            nonblock: false,
        }
    }
}

impl MessageOptions {
    /// Feature options for TCP sockets: framed network-order stream.
    pub fn tcp_socket() -> Self {
        Self::default()
    }

    /// Feature options for SCTP sockets: boundary-preserving passthrough.
    pub fn sctp_socket() -> Self {
        Self {
            read_proto: UnderlyingProtocol::SeqPacket,
            write_proto: UnderlyingProtocol::SeqPacket,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.read_byte_order = order;
        self.write_byte_order = order;
        self
    }

    #[must_use]
    pub fn read_limit(mut self, limit: u64) -> Self {
        self.read_limit = limit;
        self
    }

    #[must_use]
    pub fn nonblocking(mut self) -> Self {
        self.nonblock = true;
        self
    }
}

/// Creates a framed reader over `rd`.
pub fn message_reader<R: io::Read>(rd: R, opts: MessageOptions) -> MessageReader<R> {
    Message::build(Some(rd), None, opts)
}

/// Creates a framed writer over `wr`.
pub fn message_writer<W: io::Write>(wr: W, opts: MessageOptions) -> MessageWriter<W> {
    Message::build(None, Some(wr), opts)
}

/// Creates a framed reader/writer over the `rd`/`wr` pair.
pub fn message_read_writer<R: io::Read, W: io::Write>(
    rd: R,
    wr: W,
    opts: MessageOptions,
) -> MessageReadWriter<R, W> {
    Message::build(Some(rd), Some(wr), opts)
}

pub type MessageReader<R> = Message<R, io::Sink>;
pub type MessageWriter<W> = Message<io::Empty, W>;
pub type MessageReadWriter<R, W> = Message<R, W>;

/// A framed message channel over a byte-oriented reader and/or writer.
///
/// At most one caller holds the read side and at most one the write side at
/// any time, enforced by an atomic status word. A successful [`read`]
/// consumes exactly one frame; partial header or payload transfers are
/// resumed on the next call with the same buffer.
///
/// [`read`]: Message::read
pub struct Message<R, W> {
    rd: Option<UnsafeCell<ReadHalf<R>>>,
    wr: Option<UnsafeCell<WriteHalf<W>>>,
    status: AtomicU32,
    done: AtomicBool,
    nonblock: bool,
}

unsafe impl<R: Send, W: Send> Send for Message<R, W> {}
unsafe impl<R: Send, W: Send> Sync for Message<R, W> {}

impl<R: io::Read, W: io::Write> Message<R, W> {
    fn build(rd: Option<R>, wr: Option<W>, opts: MessageOptions) -> Self {
        Self {
            rd: rd.map(|rd| {
                UnsafeCell::new(ReadHalf {
                    rd,
                    bo: opts.read_byte_order,
                    proto: opts.read_proto,
                    limit: opts.read_limit,
                    nonblock: opts.nonblock,
                    header: [0u8; 8],
                    length: 0,
                    offset: 0,
                })
            }),
            wr: wr.map(|wr| {
                UnsafeCell::new(WriteHalf {
                    wr,
                    bo: opts.write_byte_order,
                    proto: opts.write_proto,
                    nonblock: opts.nonblock,
                    header: [0u8; 8],
                    length: 0,
                    offset: 0,
                })
            }),
            status: AtomicU32::new(0),
            done: AtomicBool::new(false),
            nonblock: opts.nonblock,
        }
    }

    /// Reads exactly one frame into `p` and returns the payload length.
    ///
    /// Returns [`Error::ShortBuffer`] if `p` is smaller than the decoded
    /// payload, [`Error::TooLong`] if the decoded length exceeds the read
    /// limit, and [`Error::UnexpectedEndOfStream`] if the underlying stream
    /// ends mid-frame. In nonblock mode a partial transfer surfaces
    /// [`Error::TemporarilyUnavailable`]; re-calling with the same buffer
    /// resumes it.
    pub fn read(&self, p: &mut [u8]) -> Result<usize> {
        if self.done.load(Ordering::Acquire) {
            return Err(Error::EndOfStream);
        }
        let cell = self.rd.as_ref().ok_or(Error::MsgInvalidArguments)?;
        self.enter(STATUS_READ)?;
        // Safety: the READ status bit grants exclusive access to the half.
        let half = unsafe { &mut *cell.get() };
        let res = if half.proto.preserve_boundary() {
            half.read_packet(p)
        } else {
            half.read_stream(p)
        };
        self.exit(STATUS_READ);
        res
    }

    /// Writes `p` as exactly one frame and returns the payload length.
    ///
    /// In nonblock mode a partial transfer surfaces
    /// [`Error::TemporarilyUnavailable`]; re-calling with the same payload
    /// resumes it.
    pub fn write(&self, p: &[u8]) -> Result<usize> {
        if self.done.load(Ordering::Acquire) {
            return Err(Error::MsgClosed);
        }
        let cell = self.wr.as_ref().ok_or(Error::MsgInvalidArguments)?;
        self.enter(STATUS_WRITE)?;
        // Safety: the WRITE status bit grants exclusive access to the half.
        let half = unsafe { &mut *cell.get() };
        let res = if half.proto.preserve_boundary() {
            half.write_packet(p)
        } else {
            half.write_stream(p)
        };
        self.exit(STATUS_WRITE);
        res
    }

    /// Closes the channel once neither side is held. Idempotent. In nonblock
    /// mode returns [`Error::TemporarilyUnavailable`] while a reader or
    /// writer is active.
    pub fn close(&self) -> Result<()> {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut sw = SpinWaiter::new();
        loop {
            let status = self.status.load(Ordering::Acquire);
            if status & (STATUS_READ | STATUS_WRITE) != 0 {
                if self.nonblock {
                    return Err(Error::TemporarilyUnavailable);
                }
                sw.once();
                continue;
            }
            match self.status.compare_exchange(
                status,
                status | STATUS_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.done.store(true, Ordering::Release);
                    return Ok(());
                }
                Err(_) => sw.once_with_level(Level::Atomic),
            }
        }
    }

    /// Consumes the channel and returns the underlying reader and writer.
    pub fn into_parts(self) -> (Option<R>, Option<W>) {
        (
            self.rd.map(|cell| cell.into_inner().rd),
            self.wr.map(|cell| cell.into_inner().wr),
        )
    }

    fn enter(&self, bit: u32) -> Result<()> {
        let mut sw = SpinWait::new();
        loop {
            let status = self.status.load(Ordering::Acquire);
            if status & STATUS_CLOSED != 0 {
                return Err(if bit == STATUS_READ {
                    Error::EndOfStream
                } else {
                    Error::MsgClosed
                });
            }
            if status & bit == 0 {
                if self
                    .status
                    .compare_exchange(status, status | bit, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(());
                }
                sw.once();
                continue;
            }
            if self.nonblock {
                return Err(Error::TemporarilyUnavailable);
            }
            sw.once();
        }
    }

    fn exit(&self, bit: u32) {
        self.status.fetch_and(!bit, Ordering::AcqRel);
    }
}

struct ReadHalf<R> {
    rd: R,
    bo: ByteOrder,
    proto: UnderlyingProtocol,
    limit: u64,
    nonblock: bool,
    header: [u8; 8],
    length: u64,
    offset: u64,
}

impl<R: io::Read> ReadHalf<R> {
    fn read_stream(&mut self, p: &mut [u8]) -> Result<usize> {
        // Leading length byte.
        while self.offset < HEADER_LEN {
            let n = self.read_once_header(HEADER_LEN)?;
            if n == 0 {
                return Err(if self.offset == 0 {
                    Error::EndOfStream
                } else {
                    Error::UnexpectedEndOfStream
                });
            }
            self.offset += n as u64;
        }
        let ex: u64 = match self.header[0] {
            254 => 2,
            255 => 7,
            _ => 0,
        };
        // Extended length field.
        while self.offset < HEADER_LEN + ex {
            let n = self.read_once_header(HEADER_LEN + ex)?;
            if n == 0 {
                return Err(Error::UnexpectedEndOfStream);
            }
            self.offset += n as u64;
        }
        if self.offset == HEADER_LEN + ex {
            self.length = match ex {
                2 => u64::from(self.bo.get_u16(&self.header[1..3])),
                7 => {
                    let composed = self.bo.get_u64(&self.header);
                    match self.bo {
                        ByteOrder::Little => composed >> 8,
                        ByteOrder::Big => composed & MAX_PAYLOAD_56,
                    }
                }
                _ => u64::from(self.header[0]),
            };
            if self.limit > 0 && self.length > self.limit {
                return Err(Error::TooLong);
            }
        }
        if self.length > p.len() as u64 {
            return Err(Error::ShortBuffer);
        }
        // Payload, resumable at the saved offset.
        let total = HEADER_LEN + ex + self.length;
        while self.offset < total {
            let start = (self.offset - HEADER_LEN - ex) as usize;
            let n = self.read_once(&mut p[start..self.length as usize])?;
            if n == 0 {
                return Err(Error::UnexpectedEndOfStream);
            }
            self.offset += n as u64;
        }
        let length = self.length as usize;
        self.reset();
        Ok(length)
    }

    fn read_packet(&mut self, p: &mut [u8]) -> Result<usize> {
        // One underlying read is one frame; no header.
        self.read_once(p)
    }

    fn read_once_header(&mut self, upto: u64) -> Result<usize> {
        let off = self.offset as usize;
        let mut sw = SpinWait::new();
        loop {
            match self.rd.read(&mut self.header[off..upto as usize]) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.nonblock {
                        return Err(Error::TemporarilyUnavailable);
                    }
                    sw.once();
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    fn read_once(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut sw = SpinWait::new();
        loop {
            match self.rd.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.nonblock {
                        return Err(Error::TemporarilyUnavailable);
                    }
                    sw.once();
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    fn reset(&mut self) {
        self.offset = 0;
    }
}

struct WriteHalf<W> {
    wr: W,
    bo: ByteOrder,
    proto: UnderlyingProtocol,
    nonblock: bool,
    header: [u8; 8],
    length: u64,
    offset: u64,
}

impl<W: io::Write> WriteHalf<W> {
    fn write_stream(&mut self, p: &[u8]) -> Result<usize> {
        if p.len() as u64 > MAX_PAYLOAD_56 {
            return Err(Error::TooLong);
        }
        if self.offset == 0 {
            self.length = p.len() as u64;
            self.encode_header();
        } else if p.len() as u64 != self.length {
            // Resumed with a different payload than the partial frame's.
            return Err(Error::MsgInvalidWrite);
        }
        let ex: u64 = if self.length <= MAX_PAYLOAD_8 {
            0
        } else if self.length <= MAX_PAYLOAD_16 {
            2
        } else {
            7
        };
        while self.offset < HEADER_LEN + ex {
            let n = self.write_once_header(HEADER_LEN + ex)?;
            if n == 0 {
                return Err(Error::ShortWrite);
            }
            self.offset += n as u64;
        }
        let total = HEADER_LEN + ex + self.length;
        while self.offset < total {
            let start = (self.offset - HEADER_LEN - ex) as usize;
            let n = self.write_once_payload(p, start)?;
            if n == 0 {
                return Err(Error::ShortWrite);
            }
            self.offset += n as u64;
        }
        let length = self.length as usize;
        self.reset();
        Ok(length)
    }

    fn write_packet(&mut self, p: &[u8]) -> Result<usize> {
        if p.len() as u64 > MAX_PAYLOAD_56 {
            return Err(Error::TooLong);
        }
        let mut sw = SpinWait::new();
        let n = loop {
            match self.wr.write(p) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.nonblock {
                        return Err(Error::TemporarilyUnavailable);
                    }
                    sw.once();
                }
                Err(e) => return Err(Error::from(e)),
            }
        };
        if n < p.len() {
            return Err(Error::ShortWrite);
        }
        Ok(n)
    }

    fn encode_header(&mut self) {
        if self.length <= MAX_PAYLOAD_8 {
            self.header[0] = self.length as u8;
        } else if self.length <= MAX_PAYLOAD_16 {
            self.header[0] = (MAX_PAYLOAD_8 + 1) as u8;
            self.bo.put_u16(&mut self.header[1..3], self.length as u16);
        } else {
            // The 8-byte header keeps 0xFF as its first byte: little-endian
            // stores length << 8, big-endian relies on the length fitting in
            // the low 56 bits.
            match self.bo {
                ByteOrder::Little => {
                    let v = self.length << 8;
                    self.bo.put_u64(&mut self.header, v);
                }
                ByteOrder::Big => {
                    let v = self.length & MAX_PAYLOAD_56;
                    self.bo.put_u64(&mut self.header, v);
                }
            }
            self.header[0] = (MAX_PAYLOAD_8 + 2) as u8;
        }
    }

    fn write_once_header(&mut self, upto: u64) -> Result<usize> {
        let off = self.offset as usize;
        let mut sw = SpinWait::new();
        loop {
            match self.wr.write(&self.header[off..upto as usize]) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.nonblock {
                        return Err(Error::TemporarilyUnavailable);
                    }
                    sw.once();
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    fn write_once_payload(&mut self, p: &[u8], start: usize) -> Result<usize> {
        let mut sw = SpinWait::new();
        loop {
            match self.wr.write(&p[start..self.length as usize]) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.nonblock {
                        return Err(Error::TemporarilyUnavailable);
                    }
                    sw.once();
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    fn reset(&mut self) {
        self.offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    /// Delivers at most `chunk` bytes per read so header and payload
    /// boundaries land mid-transfer.
    struct Chunked {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Chunked {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data,
                pos: 0,
                chunk,
            }
        }
    }

    impl io::Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn encode(payload: &[u8], order: ByteOrder) -> Vec<u8> {
        let msg = message_writer(Vec::new(), MessageOptions::default().byte_order(order));
        msg.write(payload).unwrap();
        let (_, wr) = msg.into_parts();
        wr.unwrap()
    }

    #[test]
    fn test_little_endian_four_byte_payload() {
        let wire = encode(b"ABCD", ByteOrder::Little);
        assert_eq!(wire, [0x04, 0x41, 0x42, 0x43, 0x44]);

        let msg = message_reader(
            &wire[..],
            MessageOptions::default().byte_order(ByteOrder::Little),
        );
        let mut buf = [0u8; 16];
        let n = msg.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ABCD");
    }

    #[test]
    fn test_extended_header_64k_payload() {
        let payload = vec![0x5A; 65536];
        let wire = encode(&payload, ByteOrder::Big);
        assert_eq!(&wire[..8], &[0xFF, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(wire.len(), 8 + payload.len());

        let msg = message_reader(Chunked::new(wire, 4096), MessageOptions::default());
        let mut buf = vec![0u8; 1 << 17];
        let n = msg.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &payload[..]);
    }

    #[rstest]
    #[case::direct_253(253, 1)]
    #[case::extended_254(254, 3)]
    #[case::extended_255(255, 3)]
    #[case::extended_64k_minus_one(65535, 3)]
    #[case::extended_64k(65536, 8)]
    fn test_header_encoding_boundaries(#[case] len: usize, #[case] header_len: usize) {
        let payload = vec![0xA5u8; len];
        let wire = encode(&payload, ByteOrder::Big);
        assert_eq!(wire.len(), header_len + len);
        match header_len {
            1 => assert_eq!(wire[0] as usize, len),
            3 => {
                assert_eq!(wire[0], 0xFE);
                assert_eq!(
                    u16::from_be_bytes([wire[1], wire[2]]) as usize,
                    len
                );
            }
            _ => assert_eq!(wire[0], 0xFF),
        }
    }

    #[rstest]
    #[case::byte_at_a_time(1)]
    #[case::tiny(3)]
    #[case::bulk(4096)]
    fn test_round_trip_chunked(#[case] chunk: usize) {
        let payload = (0..1000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let wire = encode(&payload, ByteOrder::Big);
        let msg = message_reader(Chunked::new(wire, chunk), MessageOptions::default());
        let mut buf = vec![0u8; 2048];
        let n = msg.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &payload[..]);
    }

    #[test]
    fn test_zero_length_frame() {
        let wire = encode(&[], ByteOrder::Big);
        assert_eq!(wire, [0x00]);
        let msg = message_reader(&wire[..], MessageOptions::default());
        let mut buf = [0u8; 4];
        assert_eq!(msg.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_sequential_frames() {
        let mut wire = encode(b"first", ByteOrder::Big);
        wire.extend(encode(b"second frame", ByteOrder::Big));
        let msg = message_reader(Chunked::new(wire, 2), MessageOptions::default());
        let mut buf = [0u8; 64];
        let n = msg.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = msg.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second frame");
        assert_eq!(msg.read(&mut buf).unwrap_err(), Error::EndOfStream);
    }

    #[test]
    fn test_read_limit() {
        let wire = encode(&[0u8; 300], ByteOrder::Big);
        let msg = message_reader(&wire[..], MessageOptions::default().read_limit(255));
        let mut buf = [0u8; 512];
        assert_eq!(msg.read(&mut buf).unwrap_err(), Error::TooLong);
    }

    #[test]
    fn test_short_buffer() {
        let wire = encode(&[1u8; 100], ByteOrder::Big);
        let msg = message_reader(&wire[..], MessageOptions::default());
        let mut buf = [0u8; 10];
        assert_eq!(msg.read(&mut buf).unwrap_err(), Error::ShortBuffer);
    }

    #[test]
    fn test_eof_mid_frame() {
        let mut wire = encode(&[7u8; 50], ByteOrder::Big);
        wire.truncate(20);
        let msg = message_reader(&wire[..], MessageOptions::default());
        let mut buf = [0u8; 64];
        assert_eq!(
            msg.read(&mut buf).unwrap_err(),
            Error::UnexpectedEndOfStream
        );
    }

    #[test]
    fn test_eof_at_frame_boundary() {
        let msg = message_reader(io::empty(), MessageOptions::default());
        let mut buf = [0u8; 4];
        assert_eq!(msg.read(&mut buf).unwrap_err(), Error::EndOfStream);
    }

    #[test]
    fn test_packet_passthrough() {
        let msg = message_read_writer(
            &b"datagram payload"[..],
            Vec::new(),
            MessageOptions::sctp_socket(),
        );
        let mut buf = [0u8; 64];
        let n = msg.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"datagram payload");

        msg.write(b"reply").unwrap();
        let (_, wr) = msg.into_parts();
        // No header on the boundary-preserving path.
        assert_eq!(wr.unwrap(), b"reply");
    }

    #[test]
    fn test_close_semantics() {
        let msg = message_read_writer(&b"\x01a"[..], Vec::new(), MessageOptions::default());
        msg.close().unwrap();
        msg.close().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(msg.read(&mut buf).unwrap_err(), Error::EndOfStream);
        assert_eq!(msg.write(b"x").unwrap_err(), Error::MsgClosed);
    }

    #[test]
    fn test_reader_only_rejects_writes() {
        let msg = message_reader(&b"\x00"[..], MessageOptions::default());
        assert_eq!(msg.write(b"x").unwrap_err(), Error::MsgInvalidArguments);
    }

    #[test]
    fn test_little_endian_extended_round_trip() {
        let payload = vec![0x11u8; 70000];
        let wire = encode(&payload, ByteOrder::Little);
        assert_eq!(wire[0], 0xFF);
        let msg = message_reader(
            Chunked::new(wire, 4096),
            MessageOptions::default().byte_order(ByteOrder::Little),
        );
        let mut buf = vec![0u8; 1 << 17];
        let n = msg.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &payload[..]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_round_trip_any_length_and_chunking(
            len in prop_oneof![0usize..600, 65530usize..65540],
            chunk in 1usize..8192,
            little in proptest::bool::ANY,
        ) {
            let order = if little { ByteOrder::Little } else { ByteOrder::Big };
            let payload = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
            let wire = encode(&payload, order);
            let msg = message_reader(
                Chunked::new(wire, chunk),
                MessageOptions::default().byte_order(order),
            );
            let mut buf = vec![0u8; len.max(1)];
            let n = msg.read(&mut buf).unwrap();
            prop_assert_eq!(&buf[..n], &payload[..]);
        }
    }
}
