//! Room membership that survives reconnects.
//!
//! The supervisor consults this on every transition into Open and replays
//! the join, so the UI never has to notice that the socket was replaced.

use sitesync_protocol::ClientMessage;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSubscription {
    current: Option<String>,
}

impl ScopeSubscription {
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Remember `id` as the joined scope. Returns the join frame to send when
    /// the channel is open and the scope actually changed.
    pub fn join(&mut self, id: String, connected: bool) -> Option<ClientMessage> {
        if self.current.as_deref() == Some(id.as_str()) {
            return None;
        }
        self.current = Some(id.clone());
        connected.then_some(ClientMessage::JoinProject { project_id: id })
    }

    /// Forget the joined scope. Returns the leave frame to send when open.
    pub fn leave(&mut self, connected: bool) -> Option<ClientMessage> {
        let previous = self.current.take()?;
        connected.then_some(ClientMessage::LeaveProject {
            project_id: previous,
        })
    }

    /// Join frame for the remembered scope, sent after each (re)connect.
    pub fn replay(&self) -> Option<ClientMessage> {
        self.current
            .as_ref()
            .map(|id| ClientMessage::JoinProject {
                project_id: id.clone(),
            })
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}
