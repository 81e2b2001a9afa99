//! Heartbeat negotiation and timing.

use std::time::Duration;

/// Negotiated heartbeat: the smaller of the local and server values.
///
/// With the local default of 0 this disables heartbeats regardless of what
/// the server proposes.
pub fn negotiate_heartbeat(local: u16, server: u16) -> u16 {
    local.min(server)
}

/// How often to send heartbeats for a negotiated value, `None` when off.
///
/// Frames go out at half the negotiated interval so one late frame does not
/// trip the peer's timeout.
pub fn heartbeat_interval(heartbeat: u16) -> Option<Duration> {
    if heartbeat == 0 {
        None
    } else {
        Some(Duration::from_millis(u64::from(heartbeat) * 500))
    }
}
