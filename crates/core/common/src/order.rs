//! Exchange order record and reconciliation
//!
//! An [`Order`] is one view of an exchange order. Views arrive from REST
//! polling and from the streaming feed in no particular order, possibly more
//! than once; [`Order::merge`] joins two views of the same order into the
//! most progressed one.

use crate::types::{Amount, Px, Qty, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server assigned order identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(String);

impl OrderId {
    /// Wrap a server assigned id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if the id is unset
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Client generated submission identifier
///
/// The exchange treats two create requests with the same client id as the
/// same order, which is what makes resubmission after a lost acknowledgement
/// safe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Wrap a client id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// No status observed yet
    #[default]
    Unknown,
    /// Accepted but not yet resting on the book
    Pending,
    /// Resting on the book
    Open,
    /// Completely filled
    Filled,
    /// Cancelled by the owner or the exchange
    Cancelled,
    /// Expired by time-in-force
    Expired,
    /// Failed after acceptance
    Failed,
}

impl OrderStatus {
    /// Whether this status is allowed to replace `self` during a merge
    #[must_use]
    pub const fn advances_to(self, next: Self) -> bool {
        match (self, next) {
            (_, Self::Unknown) => false,
            (Self::Unknown, _) => true,
            (Self::Pending, next) => !matches!(next, Self::Pending),
            (Self::Open, Self::Cancelled) => true,
            (Self::Filled, _) => false,
            (_, Self::Filled) => true,
            _ => false,
        }
    }

    /// Statuses after which the exchange will not report further fills
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Expired | Self::Failed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Pending => "PENDING",
            Self::Open => "OPEN",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One view of an exchange order
///
/// Structural equality (`==`) compares every field and is used for change
/// detection; it is independent of [`Order::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Server assigned id
    pub order_id: OrderId,
    /// Client id used at submission, when known
    pub client_order_id: Option<ClientOrderId>,
    /// Instrument the order trades
    pub product_id: String,
    /// Side, when known
    pub side: Option<Side>,
    /// Exchange reported status
    pub status: OrderStatus,
    /// Cumulative filled size
    pub filled_size: Qty,
    /// Size weighted average fill price
    pub filled_price: Px,
    /// Accumulated fee
    pub fee: Amount,
    /// Creation time
    pub create_time: Option<DateTime<Utc>>,
    /// Time of the most recent fill
    pub last_fill_time: Option<DateTime<Utc>>,
    /// Set once the exchange reports no further changes
    pub done: bool,
    /// Why the order is done
    pub done_reason: Option<String>,
}

impl Order {
    /// Create an empty view for an order id
    #[must_use]
    pub fn new(order_id: OrderId) -> Self {
        Self { order_id, ..Self::default() }
    }

    /// Whether the order can no longer change
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.done || self.status.is_final()
    }

    /// Value of the filled part of the order
    #[must_use]
    pub fn filled_value(&self) -> Amount {
        self.filled_price.notional(self.filled_size)
    }

    /// Merge an `update` view into `known`, returning the most progressed view.
    ///
    /// Fields unset in `known` are taken from `update`; fee and filled size
    /// never decrease; status only moves forward (see
    /// [`OrderStatus::advances_to`]); `done` is sticky. Views of different
    /// order ids are not merged and `known` is returned unchanged.
    #[must_use]
    pub fn merge(known: &Self, update: &Self) -> Self {
        if known.order_id != update.order_id {
            return known.clone();
        }

        let mut out = known.clone();

        if out.client_order_id.is_none() {
            out.client_order_id.clone_from(&update.client_order_id);
        }
        if out.product_id.is_empty() {
            out.product_id.clone_from(&update.product_id);
        }
        if out.side.is_none() {
            out.side = update.side;
        }
        if out.create_time.is_none() {
            out.create_time = update.create_time;
        }
        if out.fee < update.fee {
            out.fee = update.fee;
        }
        if out.filled_size < update.filled_size {
            out.filled_size = update.filled_size;
            out.filled_price = update.filled_price;
            out.last_fill_time = update.last_fill_time.or(known.last_fill_time);
        }
        if out.filled_price.is_zero() {
            out.filled_price = update.filled_price;
        }
        if out.last_fill_time.is_none() {
            out.last_fill_time = update.last_fill_time;
        }
        if out.status.advances_to(update.status) {
            out.status = update.status;
        }
        out.done |= update.done;
        if out.done_reason.is_none() {
            out.done_reason.clone_from(&update.done_reason);
        }
        out
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id: {} product: {} side: {} price: {} size: {} fee: {} status: {} done: {}}}",
            self.order_id,
            self.product_id,
            self.side.map_or("?", |s| s.as_str()),
            self.filled_price,
            self.filled_size,
            self.fee,
            self.status,
            self.done,
        )
    }
}
