//! Events delivered to the consuming application

use crate::peer::RemoteMedia;
use duet_core::Role;

/// What happened to a role's session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// Peer connection reached connected
    Ready,
    /// Negotiation or connection failed; the role needs re-initialization
    Error(String),
    /// Connectivity lost; may recover with another `Ready`
    Disconnected,
    /// Provider media arrived for the role
    RemoteMedia(RemoteMedia),
}

/// One observable event for one role
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub role: Role,
    /// Negotiation attempt that produced the event
    pub generation: u64,
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(role: Role, generation: u64, kind: SessionEventKind) -> Self {
        Self {
            role,
            generation,
            kind,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.kind, SessionEventKind::Ready)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, SessionEventKind::Error(_))
    }
}
