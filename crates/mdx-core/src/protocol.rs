//! Wire format shared by the control socket and the shared-memory data rings.
//!
//! Every frame is a fixed header followed by `count` typed records packed back
//! to back:
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬───────────┬───────┬────────┐
//! │ session │ seq     │ xmit_ts │ stream_id │ count │ size   │  28 bytes
//! │ u64     │ u64     │ u64     │ u8        │ u8    │ u16    │
//! ├─────────┴─────────┴─────────┴───────────┴───────┴────────┤
//! │ record: type u8 | size u8 | body ...                     │  x count
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian; fixed strings are null-padded. A frame with
//! `count == 0` is a heartbeat. `size` is the payload length after the header.

use crate::{
    error::{MdxError, Result},
    ring::{RingBuffer, RingMemory},
    types::{ChangedSide, SYMBOL_LEN, Timestamps, TradeStatus, symbol_from_bytes, symbol_to_bytes},
};

pub const HEADER_LEN: usize = 28;

/// Stream id used on the control socket.
pub const STREAM_ID_CONTROL: u8 = 0xFF;

pub const USER_LEN: usize = 16;
pub const PWD_LEN: usize = 16;
pub const SHM_KEY_LEN: usize = 32;
pub const SHM_PATH_LEN: usize = 128;

// Message types
pub const MSG_CONNECT: u8 = 0x01;
pub const MSG_CONNECT_RESPONSE: u8 = 0x02;
pub const MSG_DISCONNECT: u8 = 0x03;
pub const MSG_DISCONNECT_RESPONSE: u8 = 0x04;
pub const MSG_SUBSCRIBE: u8 = 0x05;
pub const MSG_SUBSCRIBE_RESPONSE: u8 = 0x06;
pub const MSG_UNSUBSCRIBE: u8 = 0x07;
pub const MSG_UNSUBSCRIBE_RESPONSE: u8 = 0x08;
pub const MSG_BOOK_REFRESHED: u8 = 0x10;
pub const MSG_BOOK_CHANGED: u8 = 0x11;
pub const MSG_TRADING_ACTION: u8 = 0x12;

// Record sizes, including the two-byte type/size prefix.
pub const CONNECT_LEN: usize = 2 + 4 + 1 + 4 + USER_LEN + PWD_LEN + SHM_KEY_LEN;
pub const CONNECT_RESPONSE_LEN: usize = 2 + 1 + 1 + 1 + SHM_PATH_LEN + 8 + 2;
pub const DISCONNECT_LEN: usize = 2 + 4;
pub const DISCONNECT_RESPONSE_LEN: usize = 2 + 1;
pub const SUBSCRIBE_LEN: usize = 2 + SYMBOL_LEN + 2 + 4;
pub const SUBSCRIBE_RESPONSE_LEN: usize = 2 + 1 + 2 + SYMBOL_LEN + 2;
pub const UNSUBSCRIBE_LEN: usize = 2 + SYMBOL_LEN + 2;
pub const BOOK_REFRESHED_LEN: usize = 2 + 2 + SYMBOL_LEN + 2;
pub const BOOK_CHANGED_LEN: usize = BOOK_REFRESHED_LEN + 1 + 32;
pub const TRADING_ACTION_LEN: usize = BOOK_REFRESHED_LEN + 1 + 32;

const _: () = assert!(CONNECT_LEN == 75);
const _: () = assert!(CONNECT_RESPONSE_LEN == 143);
const _: () = assert!(BOOK_CHANGED_LEN == 71);

/// Subscription flags carried by `CtrlConnect`.
pub mod flags {
    pub const SEND_BOOK_REFRESHED: u32 = 0x1;
    pub const SEND_BOOK_CHANGED: u32 = 0x2;
    pub const SEND_TRADING_ACTION: u32 = 0x4;
    pub const SEND_DATA_HEARTBEAT: u32 = 0x8;
    pub const ALL: u32 = SEND_BOOK_REFRESHED | SEND_BOOK_CHANGED | SEND_TRADING_ACTION | SEND_DATA_HEARTBEAT;
}

/// Status carried by `CtrlConnectResponse` and `CtrlDisconnectResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectStatus {
    Ok = 0,
    AlreadyConnected = 1,
    UnregisteredConnection = 2,
    SharedMemoryFailure = 3,
    InvalidId = 4,
    VersionMismatch = 5,
}

impl ConnectStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Ok,
            1 => Self::AlreadyConnected,
            2 => Self::UnregisteredConnection,
            3 => Self::SharedMemoryFailure,
            4 => Self::InvalidId,
            5 => Self::VersionMismatch,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscribeStatus {
    Ok = 0,
    BadSymbol = 1,
    BadExchange = 2,
}

impl SubscribeStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Ok,
            1 => Self::BadSymbol,
            2 => Self::BadExchange,
            _ => return None,
        })
    }
}

/// Kind of resource granted by a `CtrlConnectResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShmType {
    EventQueue = 0,
    BookCache = 1,
}

impl ShmType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::EventQueue),
            1 => Some(Self::BookCache),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub session: u64,
    pub sequence: u64,
    pub xmit_ts: u64,
    pub stream_id: u8,
    pub count: u8,
    pub size: u16,
}

impl FrameHeader {
    pub fn is_heartbeat(&self) -> bool {
        self.count == 0
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let mut w = Writer::new(buf);
        w.u64(self.session);
        w.u64(self.sequence);
        w.u64(self.xmit_ts);
        w.u8(self.stream_id);
        w.u8(self.count);
        w.u16(self.size);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        Ok(Self {
            session: r.u64()?,
            sequence: r.u64()?,
            xmit_ts: r.u64()?,
            stream_id: r.u8()?,
            count: r.u8()?,
            size: r.u16()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub pid: u32,
    pub client_id: u8,
    pub flags: u32,
    pub user: String,
    pub pwd: String,
    pub shm_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub client_id: u8,
    pub status: ConnectStatus,
    pub shm_type: ShmType,
    pub shm_path: String,
    pub shm_size: u64,
    pub exchange: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub symbol: String,
    pub exchange: u16,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResponse {
    pub status: SubscribeStatus,
    pub locate: u16,
    pub symbol: String,
    pub exchange: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub symbol: String,
    pub exchange: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookRefreshed {
    pub locate: u16,
    pub symbol: String,
    pub exchange: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookChanged {
    pub locate: u16,
    pub symbol: String,
    pub exchange: u16,
    pub side: ChangedSide,
    pub timestamps: Timestamps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradingAction {
    pub locate: u16,
    pub symbol: String,
    pub exchange: u16,
    pub status: TradeStatus,
    pub timestamps: Timestamps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect(Connect),
    ConnectResponse(ConnectResponse),
    Disconnect { pid: u32 },
    DisconnectResponse { status: ConnectStatus },
    Subscribe(Subscribe),
    SubscribeResponse(SubscribeResponse),
    Unsubscribe(Unsubscribe),
    UnsubscribeResponse(SubscribeResponse),
    BookRefreshed(BookRefreshed),
    BookChanged(BookChanged),
    TradingAction(TradingAction),
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::Connect(_) => MSG_CONNECT,
            Self::ConnectResponse(_) => MSG_CONNECT_RESPONSE,
            Self::Disconnect { .. } => MSG_DISCONNECT,
            Self::DisconnectResponse { .. } => MSG_DISCONNECT_RESPONSE,
            Self::Subscribe(_) => MSG_SUBSCRIBE,
            Self::SubscribeResponse(_) => MSG_SUBSCRIBE_RESPONSE,
            Self::Unsubscribe(_) => MSG_UNSUBSCRIBE,
            Self::UnsubscribeResponse(_) => MSG_UNSUBSCRIBE_RESPONSE,
            Self::BookRefreshed(_) => MSG_BOOK_REFRESHED,
            Self::BookChanged(_) => MSG_BOOK_CHANGED,
            Self::TradingAction(_) => MSG_TRADING_ACTION,
        }
    }

    pub fn wire_len(&self) -> usize {
        record_len(self.msg_type()).unwrap_or(0)
    }

    /// Append this record; `w` must have `wire_len()` bytes left.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.u8(self.msg_type());
        w.u8(self.wire_len() as u8);
        match self {
            Self::Connect(m) => {
                w.u32(m.pid);
                w.u8(m.client_id);
                w.u32(m.flags);
                w.fixed_str(&m.user, USER_LEN);
                w.fixed_str(&m.pwd, PWD_LEN);
                w.fixed_str(&m.shm_key, SHM_KEY_LEN);
            }
            Self::ConnectResponse(m) => {
                w.u8(m.client_id);
                w.u8(m.status as u8);
                w.u8(m.shm_type as u8);
                w.fixed_str(&m.shm_path, SHM_PATH_LEN);
                w.u64(m.shm_size);
                w.u16(m.exchange);
            }
            Self::Disconnect { pid } => w.u32(*pid),
            Self::DisconnectResponse { status } => w.u8(*status as u8),
            Self::Subscribe(m) => {
                w.symbol(&m.symbol);
                w.u16(m.exchange);
                w.u32(m.flags);
            }
            Self::SubscribeResponse(m) | Self::UnsubscribeResponse(m) => {
                w.u8(m.status as u8);
                w.u16(m.locate);
                w.symbol(&m.symbol);
                w.u16(m.exchange);
            }
            Self::Unsubscribe(m) => {
                w.symbol(&m.symbol);
                w.u16(m.exchange);
            }
            Self::BookRefreshed(m) => {
                w.u16(m.locate);
                w.symbol(&m.symbol);
                w.u16(m.exchange);
            }
            Self::BookChanged(m) => {
                w.u16(m.locate);
                w.symbol(&m.symbol);
                w.u16(m.exchange);
                w.u8(m.side as u8);
                w.timestamps(&m.timestamps);
            }
            Self::TradingAction(m) => {
                w.u16(m.locate);
                w.symbol(&m.symbol);
                w.u16(m.exchange);
                w.u8(m.status as u8);
                w.timestamps(&m.timestamps);
            }
        }
    }

    /// Read one record. The declared size must match this build's layout.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let msg_type = r.u8()?;
        let declared = r.u8()? as usize;
        let expected = record_len(msg_type)
            .ok_or_else(|| MdxError::Protocol(format!("unknown message type {msg_type:#04x}")))?;
        if declared != expected {
            return Err(MdxError::Protocol(format!(
                "message {msg_type:#04x} declares {declared} bytes, expected {expected}"
            )));
        }

        let msg = match msg_type {
            MSG_CONNECT => Self::Connect(Connect {
                pid: r.u32()?,
                client_id: r.u8()?,
                flags: r.u32()?,
                user: r.fixed_str(USER_LEN)?,
                pwd: r.fixed_str(PWD_LEN)?,
                shm_key: r.fixed_str(SHM_KEY_LEN)?,
            }),
            MSG_CONNECT_RESPONSE => Self::ConnectResponse(ConnectResponse {
                client_id: r.u8()?,
                status: connect_status(r.u8()?)?,
                shm_type: {
                    let v = r.u8()?;
                    ShmType::from_u8(v).ok_or_else(|| MdxError::Protocol(format!("bad shm type {v}")))?
                },
                shm_path: r.fixed_str(SHM_PATH_LEN)?,
                shm_size: r.u64()?,
                exchange: r.u16()?,
            }),
            MSG_DISCONNECT => Self::Disconnect { pid: r.u32()? },
            MSG_DISCONNECT_RESPONSE => Self::DisconnectResponse { status: connect_status(r.u8()?)? },
            MSG_SUBSCRIBE => Self::Subscribe(Subscribe { symbol: r.symbol()?, exchange: r.u16()?, flags: r.u32()? }),
            MSG_SUBSCRIBE_RESPONSE => Self::SubscribeResponse(subscribe_response(r)?),
            MSG_UNSUBSCRIBE => Self::Unsubscribe(Unsubscribe { symbol: r.symbol()?, exchange: r.u16()? }),
            MSG_UNSUBSCRIBE_RESPONSE => Self::UnsubscribeResponse(subscribe_response(r)?),
            MSG_BOOK_REFRESHED => {
                Self::BookRefreshed(BookRefreshed { locate: r.u16()?, symbol: r.symbol()?, exchange: r.u16()? })
            }
            MSG_BOOK_CHANGED => Self::BookChanged(BookChanged {
                locate: r.u16()?,
                symbol: r.symbol()?,
                exchange: r.u16()?,
                side: ChangedSide::from_u8(r.u8()?),
                timestamps: r.timestamps()?,
            }),
            MSG_TRADING_ACTION => Self::TradingAction(TradingAction {
                locate: r.u16()?,
                symbol: r.symbol()?,
                exchange: r.u16()?,
                status: TradeStatus::from_u8(r.u8()?),
                timestamps: r.timestamps()?,
            }),
            _ => unreachable!("record_len accepted {msg_type}"),
        };
        Ok(msg)
    }
}

fn record_len(msg_type: u8) -> Option<usize> {
    Some(match msg_type {
        MSG_CONNECT => CONNECT_LEN,
        MSG_CONNECT_RESPONSE => CONNECT_RESPONSE_LEN,
        MSG_DISCONNECT => DISCONNECT_LEN,
        MSG_DISCONNECT_RESPONSE => DISCONNECT_RESPONSE_LEN,
        MSG_SUBSCRIBE => SUBSCRIBE_LEN,
        MSG_SUBSCRIBE_RESPONSE | MSG_UNSUBSCRIBE_RESPONSE => SUBSCRIBE_RESPONSE_LEN,
        MSG_UNSUBSCRIBE => UNSUBSCRIBE_LEN,
        MSG_BOOK_REFRESHED => BOOK_REFRESHED_LEN,
        MSG_BOOK_CHANGED => BOOK_CHANGED_LEN,
        MSG_TRADING_ACTION => TRADING_ACTION_LEN,
        _ => return None,
    })
}

fn connect_status(v: u8) -> Result<ConnectStatus> {
    ConnectStatus::from_u8(v).ok_or_else(|| MdxError::Protocol(format!("bad connect status {v}")))
}

fn subscribe_response(r: &mut Reader<'_>) -> Result<SubscribeResponse> {
    let v = r.u8()?;
    Ok(SubscribeResponse {
        status: SubscribeStatus::from_u8(v).ok_or_else(|| MdxError::Protocol(format!("bad subscribe status {v}")))?,
        locate: r.u16()?,
        symbol: r.symbol()?,
        exchange: r.u16()?,
    })
}

/// Type byte of the first record in a payload, if any.
pub fn first_record_type(payload: &[u8]) -> Option<u8> {
    payload.first().copied()
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Total frame length for a set of records.
pub fn frame_len(messages: &[Message]) -> usize {
    HEADER_LEN + messages.iter().map(Message::wire_len).sum::<usize>()
}

/// Header `count` and `size` for a batch, or an error when the batch does not
/// fit the header's fields.
fn batch_bounds(messages: &[Message]) -> Result<(u8, u16)> {
    let count = u8::try_from(messages.len())
        .map_err(|_| MdxError::Protocol(format!("{} records exceed one frame", messages.len())))?;
    let payload = frame_len(messages) - HEADER_LEN;
    let size = u16::try_from(payload)
        .map_err(|_| MdxError::Protocol(format!("{payload} payload bytes exceed one frame")))?;
    Ok((count, size))
}

/// Encode a frame into `buf`, which must be exactly `frame_len(messages)` long.
pub fn encode_frame_into(
    buf: &mut [u8],
    session: u64,
    sequence: u64,
    stream_id: u8,
    xmit_ts: u64,
    messages: &[Message],
) -> Result<()> {
    let (count, size) = batch_bounds(messages)?;
    debug_assert_eq!(buf.len(), HEADER_LEN + size as usize);
    let header = FrameHeader { session, sequence, xmit_ts, stream_id, count, size };
    header.encode(&mut buf[..HEADER_LEN]);
    let mut w = Writer::new(&mut buf[HEADER_LEN..]);
    for m in messages {
        m.encode(&mut w);
    }
    Ok(())
}

pub fn encode_frame(session: u64, sequence: u64, stream_id: u8, xmit_ts: u64, messages: &[Message]) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; frame_len(messages)];
    encode_frame_into(&mut buf, session, sequence, stream_id, xmit_ts, messages)?;
    Ok(buf)
}

/// Decode the records of a payload described by `header`.
pub fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Vec<Message>> {
    if payload.len() != header.size as usize {
        return Err(MdxError::Protocol(format!(
            "payload is {} bytes, header declares {}",
            payload.len(),
            header.size
        )));
    }
    let mut r = Reader::new(payload);
    let mut out = Vec::with_capacity(header.count as usize);
    for _ in 0..header.count {
        out.push(Message::decode(&mut r)?);
    }
    if r.remaining() != 0 {
        return Err(MdxError::Protocol(format!("{} trailing payload bytes", r.remaining())));
    }
    Ok(out)
}

pub fn decode_frame(buf: &[u8]) -> Result<(FrameHeader, Vec<Message>)> {
    if buf.len() < HEADER_LEN {
        return Err(MdxError::Protocol(format!("frame of {} bytes is shorter than a header", buf.len())));
    }
    let header = FrameHeader::decode(&buf[..HEADER_LEN])?;
    let messages = decode_payload(&header, &buf[HEADER_LEN..])?;
    Ok((header, messages))
}

/// Write one frame straight into a ring. `Ok(false)` if the ring has no room;
/// an error if the batch cannot be framed at all.
pub fn write_frame<M: RingMemory>(
    ring: &mut RingBuffer<M>,
    session: u64,
    sequence: u64,
    stream_id: u8,
    xmit_ts: u64,
    messages: &[Message],
) -> Result<bool> {
    batch_bounds(messages)?;
    let len = frame_len(messages);
    match ring.reserve_write(len) {
        Some(buf) => {
            encode_frame_into(buf, session, sequence, stream_id, xmit_ts, messages)?;
            ring.commit_write(len);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Take the next complete frame off a ring, if one is fully committed.
///
/// A frame that fails to decode is still consumed so the reader can make
/// progress.
pub fn poll_frame<M: RingMemory>(ring: &mut RingBuffer<M>) -> Result<Option<(FrameHeader, Vec<Message>)>> {
    let header = match ring.reserve_read(HEADER_LEN) {
        Some(buf) => FrameHeader::decode(buf)?,
        None => return Ok(None),
    };
    let total = HEADER_LEN + header.size as usize;
    let decoded = match ring.reserve_read(total) {
        Some(buf) => decode_payload(&header, &buf[HEADER_LEN..]),
        None => return Ok(None),
    };
    ring.commit_read(total);
    decoded.map(|messages| Some((header, messages)))
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Little-endian cursor over a fixed output slice. Callers size the slice
/// up front, so running off the end is a bug and panics.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    pub fn u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    pub fn fixed_str(&mut self, s: &str, width: usize) {
        let len = s.len().min(width);
        self.put(&s.as_bytes()[..len]);
        self.buf[self.pos..self.pos + width - len].fill(0);
        self.pos += width - len;
    }

    pub fn symbol(&mut self, s: &str) {
        self.put(&symbol_to_bytes(s));
    }

    pub fn timestamps(&mut self, ts: &Timestamps) {
        self.u64(ts.src_receive);
        self.u64(ts.src_transmit);
        self.u64(ts.producer_receive);
        self.u64(ts.producer_transmit);
    }
}

/// Little-endian cursor over received bytes.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(MdxError::Protocol(format!(
                "truncated: wanted {n} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn fixed_str(&mut self, width: usize) -> Result<String> {
        Ok(symbol_from_bytes(self.take(width)?).to_string())
    }

    pub fn symbol(&mut self) -> Result<String> {
        self.fixed_str(SYMBOL_LEN)
    }

    pub fn timestamps(&mut self) -> Result<Timestamps> {
        Ok(Timestamps {
            src_receive: self.u64()?,
            src_transmit: self.u64()?,
            producer_receive: self.u64()?,
            producer_transmit: self.u64()?,
        })
    }
}
