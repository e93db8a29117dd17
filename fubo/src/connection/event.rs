// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{Packet, PacketId};
use std::time::Duration;

use crate::error::Error;

/// Timers the connection asks its host to maintain.
///
/// The connection is the single source of truth for when a timer is armed
/// or cancelled; the host owns the actual clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Client side, fires when it is time to send a ping request.
    PingreqSend,

    /// Server side, fires when no packet arrived for 1.5 times the
    /// keep alive interval.
    PingreqRecv,

    /// Client side, fires when the ping response did not arrive in time.
    PingrespRecv,
}

/// Timer instruction carried by [`Event::Timer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerOp {
    /// (Re)arm the timer with this duration.
    Reset(TimerKind, Duration),

    /// Stop the timer if it is running.
    Cancel(TimerKind),
}

/// Side effects emitted by the connection in response to one input call.
///
/// The host drains the returned list in order: writes packets, programs
/// timers, hands received packets to the application and returns released
/// packet ids to waiters.
#[derive(Debug)]
pub enum Event {
    /// A complete inbound packet, for the host to act on.
    RecvPacket(Packet),

    /// A packet the host must serialize and write to the stream.
    SendPacket(Packet),

    /// Program or cancel a timer.
    Timer(TimerOp),

    /// A packet id finished its round trip and returned to the pool.
    ReleasePacketId(PacketId),

    /// A framing or protocol failure. When fatal, [`Event::Close`]
    /// follows in the same batch.
    Error(Error),

    /// The transport must be shut down.
    Close,
}
