//! Command lanes.
//!
//! Each lane is a single-consumer queue: an unbounded channel drained by one
//! dedicated worker task, so the operations it owns are processed strictly in
//! order and never concurrently with each other. A failing command is logged
//! and contained; it never stops the lane. Lanes run concurrently with
//! respect to each other.

pub mod dispatch;
pub mod network;
pub mod tunnel;

pub use dispatch::{DispatchLane, Intent, Mode};
pub use network::{NetCommand, NetEvent, NetworkLane};
pub use tunnel::{TunnelCommand, TunnelEvent, TunnelLane};
