//! Crash-recoverable ladder trading
//!
//! A [`Looper`] owns one buy point and one sell point on a product and
//! alternates buy and sell [`Limiter`] legs so that its holdings stay
//! between zero and the buy size. Every leg and looper is persisted under
//! `/loopers/` and reloads into the exact same state after a restart.

#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod limiter;
pub mod looper;
pub mod messenger;
pub mod runtime;

pub use error::{LooperError, LooperResult};
pub use limiter::{LegState, Limiter};
pub use looper::{LegStatus, Looper, LooperStatus};
pub use messenger::{LogMessenger, MemoryMessenger, Messenger};
pub use runtime::{LooperOptions, Runtime};

/// Directory holding looper and leg state
pub const LOOPERS_DIR: &str = "/loopers";

/// Storage key of the looper or leg `uid`
#[must_use]
pub fn state_key(uid: &str) -> String {
    format!("{LOOPERS_DIR}/{uid}")
}
