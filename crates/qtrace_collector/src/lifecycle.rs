//! Postmaster lifecycle events.
//!
//! Four named probes report backend forks and reaps so the coordinator can
//! attach to children started after it and detach from reaped ones. The
//! wire payload is three int32 fields; `socket_fd` is only populated for
//! backend forks.

use bytes::{Buf, BufMut};

pub const LIFECYCLE_EVENT_WIRE_SIZE: usize = 12;

/// Marker names the postmaster fires, in event-kind order.
pub const LIFECYCLE_MARKERS: [&str; 4] = [
    "postmaster_fork_backend",
    "postmaster_fork_background",
    "postmaster_reap_backend",
    "postmaster_reap_background",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEventKind {
    ForkBackend = 0,
    ForkBackground = 1,
    ReapBackend = 2,
    ReapBackground = 3,
}

impl LifecycleEventKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::ForkBackend),
            1 => Some(Self::ForkBackground),
            2 => Some(Self::ReapBackend),
            3 => Some(Self::ReapBackground),
            _ => None,
        }
    }

    pub fn marker_name(self) -> &'static str {
        LIFECYCLE_MARKERS[self as usize]
    }

    pub fn is_fork(self) -> bool {
        matches!(self, Self::ForkBackend | Self::ForkBackground)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub pid: i32,
    pub socket_fd: i32,
}

impl LifecycleEvent {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_i32_ne(self.kind as i32);
        buf.put_i32_ne(self.pid);
        buf.put_i32_ne(self.socket_fd);
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() != LIFECYCLE_EVENT_WIRE_SIZE {
            return None;
        }
        let kind = LifecycleEventKind::from_i32(buf.get_i32_ne())?;
        Some(Self {
            kind,
            pid: buf.get_i32_ne(),
            socket_fd: buf.get_i32_ne(),
        })
    }

    /// The socket fd, only meaningful on backend forks.
    pub fn client_socket(&self) -> Option<i32> {
        if self.kind == LifecycleEventKind::ForkBackend && self.socket_fd >= 0 {
            Some(self.socket_fd)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_roundtrip() {
        let event = LifecycleEvent {
            kind: LifecycleEventKind::ForkBackend,
            pid: 4321,
            socket_fd: 17,
        };
        let mut buf = Vec::new();
        event.encode(&mut buf);
        assert_eq!(LifecycleEvent::decode(&buf), Some(event));
        assert_eq!(event.client_socket(), Some(17));
    }

    #[test]
    fn socket_fd_ignored_on_non_backend_events() {
        let event = LifecycleEvent {
            kind: LifecycleEventKind::ForkBackground,
            pid: 99,
            socket_fd: 17,
        };
        assert_eq!(event.client_socket(), None);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7i32.to_ne_bytes());
        buf.extend_from_slice(&1i32.to_ne_bytes());
        buf.extend_from_slice(&0i32.to_ne_bytes());
        assert_eq!(LifecycleEvent::decode(&buf), None);
    }
}
