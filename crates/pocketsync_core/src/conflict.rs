//! Push conflict resolution.
//!
//! A conflict exists when a pushed change targets a document that has
//! advanced on the server past the pusher's checkpoint. The session
//! hands both versions to a [`ConflictResolver`] and applies whatever
//! it decides; the connection is never torn down over a conflict.

use pocketsync_protocol::ChangeRecord;
use serde_json::Value;

/// The resolver's decision for one conflicting change.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the server's version; the pushed change is discarded.
    UseLocal,
    /// Apply the pushed version over the server's.
    UseRemote,
    /// Apply a document the resolver synthesized from both versions.
    Merged(Value),
}

/// Decides the outcome when a pushed change collides with a newer
/// server-side change to the same document.
pub trait ConflictResolver: Send + Sync {
    /// Resolves a collision between the server's latest change for a
    /// document and the pushed one.
    fn resolve(&self, local: &ChangeRecord, remote: &ChangeRecord) -> Resolution;
}

/// Default resolver: the change with the later wall-clock timestamp
/// wins, the pushed change on a tie.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn resolve(&self, local: &ChangeRecord, remote: &ChangeRecord) -> Resolution {
        if remote.timestamp >= local.timestamp {
            Resolution::UseRemote
        } else {
            Resolution::UseLocal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(timestamp: u64, title: &str) -> ChangeRecord {
        ChangeRecord::update(
            "todos",
            "d1",
            json!({"_id": "d1", "title": title}),
            None,
            timestamp,
            "n1",
        )
    }

    #[test]
    fn newer_remote_wins() {
        let local = record(100, "server");
        let remote = record(200, "client");
        assert_eq!(LastWriteWins.resolve(&local, &remote), Resolution::UseRemote);
    }

    #[test]
    fn newer_local_wins() {
        let local = record(300, "server");
        let remote = record(200, "client");
        assert_eq!(LastWriteWins.resolve(&local, &remote), Resolution::UseLocal);
    }

    #[test]
    fn tie_goes_to_remote() {
        let local = record(200, "server");
        let remote = record(200, "client");
        assert_eq!(LastWriteWins.resolve(&local, &remote), Resolution::UseRemote);
    }
}
