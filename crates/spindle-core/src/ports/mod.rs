//! Ports - 抽象化レイヤー
//!
//! 外部要因（いまは時刻のみ）を trait で差し替え可能にする。

pub mod clock;

pub use self::clock::{Clock, FixedClock, SystemClock};
