#![forbid(unsafe_code)]

// Connection directory - which session and participant each live connection stands for

use crate::session::ConnectionId;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub session_id: String,
    pub participant_id: String,
}

/// At most one binding per connection
#[derive(Default)]
pub struct ConnectionDirectory {
    bindings: StdRwLock<HashMap<ConnectionId, Binding>>,
}

impl ConnectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `connection`, returning whatever it was bound to before
    pub fn bind(&self, connection: ConnectionId, binding: Binding) -> Option<Binding> {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.insert(connection, binding)
    }

    pub fn resolve(&self, connection: ConnectionId) -> Option<Binding> {
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        bindings.get(&connection).cloned()
    }

    /// Removes the binding only if it still names `participant_id`
    pub fn unbind_participant(&self, connection: ConnectionId, participant_id: &str) -> Option<Binding> {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        match bindings.get(&connection) {
            Some(binding) if binding.participant_id == participant_id => bindings.remove(&connection),
            _ => None,
        }
    }

    pub fn unbind(&self, connection: ConnectionId) -> Option<Binding> {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.remove(&connection)
    }

    pub fn len(&self) -> usize {
        self.bindings.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(session: &str, participant: &str) -> Binding {
        Binding { session_id: session.into(), participant_id: participant.into() }
    }

    #[test]
    fn rebinding_replaces_the_previous_binding() {
        let directory = ConnectionDirectory::new();
        let conn = ConnectionId::new();

        assert_eq!(directory.bind(conn, binding("m1", "p1")), None);
        assert_eq!(directory.bind(conn, binding("m2", "p9")), Some(binding("m1", "p1")));
        assert_eq!(directory.resolve(conn), Some(binding("m2", "p9")));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn stale_unbind_leaves_a_newer_binding() {
        let directory = ConnectionDirectory::new();
        let conn = ConnectionId::new();
        directory.bind(conn, binding("m2", "p9"));

        assert_eq!(directory.unbind_participant(conn, "p1"), None);
        assert_eq!(directory.unbind_participant(conn, "p9"), Some(binding("m2", "p9")));
        assert!(directory.is_empty());
        assert_eq!(directory.unbind(conn), None);
    }
}
