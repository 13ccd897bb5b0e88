//! Enumerations and constants shared across the book cache, the ticker and
//! the wire protocol.
//!
//! Discriminants are part of the wire format and must not be renumbered.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Exchange codes
// ---------------------------------------------------------------------------

pub const EXCHANGE_NONE: u16 = 0x0000;
pub const EXCHANGE_CFFEX: u16 = 0x0001;
pub const EXCHANGE_CZCE: u16 = 0x0002;
pub const EXCHANGE_DCE: u16 = 0x0003;
pub const EXCHANGE_INE: u16 = 0x0004;
pub const EXCHANGE_SHFE: u16 = 0x0005;

// ---------------------------------------------------------------------------
// Price defaults
// ---------------------------------------------------------------------------

/// Price of an empty level.
pub const PRICE_BLANK: i64 = i64::MIN;
pub const DEFAULT_PRICE_SCALE: u8 = 4;
pub const DEFAULT_LOT_SIZE: u32 = 100;

// ---------------------------------------------------------------------------
// Book sides
// ---------------------------------------------------------------------------

/// One side of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// `true` when `a` ranks strictly ahead of `b` on this side.
    #[inline]
    pub fn is_better(self, a: i64, b: i64) -> bool {
        match self {
            Side::Bid => a > b,
            Side::Ask => a < b,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bid => write!(f, "bid"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

/// Which side(s) a book-changed event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChangedSide {
    Bid = 0,
    Ask = 1,
    Both = 2,
    #[default]
    None = 255,
}

impl ChangedSide {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Bid,
            1 => Self::Ask,
            2 => Self::Both,
            _ => Self::None,
        }
    }

    /// Merge another changed side into this one.
    pub fn merge(self, side: Side) -> Self {
        let other = Self::from(side);
        match self {
            Self::None => other,
            s if s == other => s,
            _ => Self::Both,
        }
    }
}

impl From<Side> for ChangedSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Bid => Self::Bid,
            Side::Ask => Self::Ask,
        }
    }
}

// ---------------------------------------------------------------------------
// Trading status
// ---------------------------------------------------------------------------

/// Instrument trading phase reported by the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TradeStatus {
    Auction = 0,
    AuctionClose = 1,
    AuctionClose2 = 2,
    AuctionIntraday = 3,
    AuctionIntraday2 = 4,
    AuctionOpen = 5,
    AuctionOpen2 = 6,
    AuctionVolatility = 7,
    AuctionVolatility2 = 8,
    Closed = 9,
    Halt = 10,
    HaltQuoting = 11,
    Obtrd = 12,
    Popen = 13,
    PostClose = 14,
    #[default]
    None = 255,
}

impl TradeStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Auction,
            1 => Self::AuctionClose,
            2 => Self::AuctionClose2,
            3 => Self::AuctionIntraday,
            4 => Self::AuctionIntraday2,
            5 => Self::AuctionOpen,
            6 => Self::AuctionOpen2,
            7 => Self::AuctionVolatility,
            8 => Self::AuctionVolatility2,
            9 => Self::Closed,
            10 => Self::Halt,
            11 => Self::HaltQuoting,
            12 => Self::Obtrd,
            13 => Self::Popen,
            14 => Self::PostClose,
            _ => Self::None,
        }
    }
}

/// Event timestamps carried on book-changed and trading-action messages,
/// all in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamps {
    pub src_receive: u64,
    pub src_transmit: u64,
    pub producer_receive: u64,
    pub producer_transmit: u64,
}
