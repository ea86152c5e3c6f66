//! Connection Tracking Module
//!
//! NIST 800-53: AC-12 (Session Termination), AC-10 (Concurrent Session Control)
//! STIG: V-222601 - The application must terminate sessions after organization-defined conditions
//! Implementation: Tracks live connections and limits how many may be open at once

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A live connection as seen by the server
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Server-assigned connection identifier
    pub id: u64,
    /// Remote peer address
    pub peer: SocketAddr,
    /// Authenticated user name, once authentication succeeded
    pub user: Option<String>,
    /// Time the TCP connection was accepted
    pub connected_at: DateTime<Utc>,
}

/// Tracks live connections
///
/// NIST 800-53: AC-10 (Concurrent Session Control), AC-12 (Session Termination)
/// STIG: V-222601 - Session termination
/// Implementation: Enforces a maximum number of concurrent connections; cloning shares state
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    max_connections: usize,
    connections: Arc<Mutex<HashMap<u64, ConnectionInfo>>>,
    next_connection_id: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker
    ///
    /// # Arguments
    ///
    /// * `max_connections` - Maximum concurrent connections, 0 for unlimited
    ///
    /// # NIST 800-53: AC-10 (Concurrent Session Control)
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a newly accepted connection
    ///
    /// # Returns
    ///
    /// Connection ID if registered, `None` if the limit is reached
    ///
    /// # NIST 800-53: AC-10 (Concurrent Session Control)
    /// # STIG: V-222601
    pub async fn register_connection(&self, peer: SocketAddr) -> Option<u64> {
        let mut connections = self.connections.lock().await;

        if self.max_connections > 0 && connections.len() >= self.max_connections {
            warn!(
                %peer,
                max_connections = self.max_connections,
                "Rejecting connection - max connections exceeded"
            );
            return None;
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        connections.insert(
            id,
            ConnectionInfo {
                id,
                peer,
                user: None,
                connected_at: Utc::now(),
            },
        );

        debug!(
            connection_id = id,
            %peer,
            active = connections.len(),
            "Registered connection"
        );

        Some(id)
    }

    /// Record the user a connection authenticated as
    pub async fn set_user(&self, connection_id: u64, user: &str) {
        let mut connections = self.connections.lock().await;
        if let Some(info) = connections.get_mut(&connection_id) {
            info.user = Some(user.to_string());
        }
    }

    /// Unregister a connection
    ///
    /// # NIST 800-53: AC-12 (Session Termination)
    pub async fn unregister_connection(&self, connection_id: u64) {
        let mut connections = self.connections.lock().await;

        if let Some(info) = connections.remove(&connection_id) {
            let duration = Utc::now().signed_duration_since(info.connected_at);
            info!(
                connection_id,
                peer = %info.peer,
                user = info.user.as_deref().unwrap_or("-"),
                duration_secs = duration.num_seconds(),
                remaining = connections.len(),
                "Connection closed"
            );
        }
    }

    /// Number of live connections
    pub async fn active_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Snapshot of the live connections, ordered by ID
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let connections = self.connections.lock().await;
        let mut list: Vec<ConnectionInfo> = connections.values().cloned().collect();
        list.sort_by_key(|info| info.id);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_connection_limit_enforcement() {
        let tracker = ConnectionTracker::new(2);

        let conn1 = tracker.register_connection(peer(1000)).await;
        assert!(conn1.is_some());
        assert!(tracker.register_connection(peer(1001)).await.is_some());

        // Third connection should fail (limit = 2)
        assert!(tracker.register_connection(peer(1002)).await.is_none());

        // After unregistering one, should allow new connection
        tracker.unregister_connection(conn1.unwrap()).await;
        assert!(tracker.register_connection(peer(1003)).await.is_some());
    }

    #[tokio::test]
    async fn test_unlimited() {
        let tracker = ConnectionTracker::new(0);
        for port in 0..100 {
            assert!(tracker.register_connection(peer(port)).await.is_some());
        }
        assert_eq!(tracker.active_count().await, 100);
    }

    #[tokio::test]
    async fn test_user_recorded_and_cleanup() {
        let tracker = ConnectionTracker::new(4);

        let id = tracker.register_connection(peer(2000)).await.unwrap();
        tracker.set_user(id, "root").await;

        let list = tracker.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].user.as_deref(), Some("root"));
        assert_eq!(list[0].peer, peer(2000));

        tracker.unregister_connection(id).await;
        assert_eq!(tracker.active_count().await, 0);

        // Unknown IDs are ignored
        tracker.unregister_connection(id).await;
        tracker.set_user(id, "root").await;
        assert!(tracker.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let tracker = ConnectionTracker::new(0);
        let a = tracker.register_connection(peer(1)).await.unwrap();
        tracker.unregister_connection(a).await;
        let b = tracker.register_connection(peer(1)).await.unwrap();
        assert_ne!(a, b);
    }
}
