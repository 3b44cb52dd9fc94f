//! Migration control channel (spec §2 item 11, §5, §6, §4.6's predump
//! framing).
//!
//! Framed with the same length-prefixed pattern as `shared::protocol`
//! (documented stand-in for the teacher's original protobuf-over-vsock wire
//! format — see the workspace-level ambient stack note) but serde-tagged
//! JSON payloads instead of protobuf, since this crate has no protobuf
//! toolchain dependency and JSON keeps the migration session self-contained.
use crate::idmap::IdmapSet;
use serde::{Deserialize, Serialize};
use shared::protocol::{receive_frame, send_frame, FrameError};
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no compatible {0} found between offer and receiver support")]
    NoCompatibleOption(&'static str),
}

/// Sent once at the start of a migration session, describing what the
/// sender is prepared to offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationHeader {
    pub fs_type: String,
    pub idmap: IdmapSet,
    pub rsync_features: Vec<String>,
    pub snapshot_names: Vec<String>,
    pub volume_size_bytes: u64,
    pub index_header_version: u32,
    pub predump: bool,
    pub criu_type: Option<String>,
}

/// Success/failure handshake, sent after both sides drain their content
/// channels (spec §5's ordering guarantee).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationControl {
    pub success: bool,
    pub message: String,
}

/// Marks the boundary between a pre-dump iteration and the next, or between
/// the last pre-dump iteration and the final dump (spec §4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MigrationSync {
    pub final_pre_dump: bool,
}

/// Send one migration-channel message (header, control, or sync) framed the
/// same way the guest agent vsock channel is.
pub async fn send_message<W, T>(stream: &mut W, message: &T) -> Result<(), MigrationError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    send_frame(stream, &payload).await?;
    Ok(())
}

pub async fn receive_message<R, T>(stream: &mut R) -> Result<T, MigrationError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let payload = receive_frame(stream).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Negotiate a single shared option (fs type, criu type, ...) between what
/// the source offers and what the receiver supports. Spec §8 property 9:
/// an empty intersection is a hard failure, never a silent fallback.
pub fn negotiate_option(
    kind: &'static str,
    offered: &[String],
    supported: &[String],
) -> Result<String, MigrationError> {
    offered
        .iter()
        .find(|candidate| supported.contains(candidate))
        .cloned()
        .ok_or(MigrationError::NoCompatibleOption(kind))
}

/// Negotiate the full rsync feature set as the intersection of offered and
/// supported features, preserving the offer's order.
pub fn negotiate_rsync_features(offered: &[String], supported: &[String]) -> Vec<String> {
    offered
        .iter()
        .filter(|feature| supported.contains(feature))
        .cloned()
        .collect()
}

/// Index-header version is `min(offer, receiver)` per spec §4.6/§5.
pub fn negotiate_index_header_version(offer: u32, receiver: u32) -> u32 {
    offer.min(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_negotiation_takes_the_minimum() {
        assert_eq!(negotiate_index_header_version(3, 5), 3);
        assert_eq!(negotiate_index_header_version(5, 3), 3);
    }

    #[test]
    fn rsync_feature_negotiation_preserves_offer_order() {
        let offered = vec!["xattrs".to_string(), "delete".to_string(), "compress".to_string()];
        let supported = vec!["compress".to_string(), "xattrs".to_string()];
        let negotiated = negotiate_rsync_features(&offered, &supported);
        assert_eq!(negotiated, vec!["xattrs".to_string(), "compress".to_string()]);
    }

    #[test]
    fn empty_intersection_is_a_hard_failure() {
        let offered = vec!["btrfs".to_string()];
        let supported = vec!["zfs".to_string()];
        let err = negotiate_option("fs_type", &offered, &supported).unwrap_err();
        assert!(matches!(err, MigrationError::NoCompatibleOption("fs_type")));
    }

    #[tokio::test]
    async fn header_round_trips_over_a_framed_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let header = MigrationHeader {
            fs_type: "dir".to_string(),
            idmap: IdmapSet::default(),
            rsync_features: vec!["xattrs".to_string()],
            snapshot_names: vec!["snap0".to_string()],
            volume_size_bytes: 1024,
            index_header_version: 2,
            predump: true,
            criu_type: Some("criu".to_string()),
        };
        send_message(&mut a, &header).await.unwrap();
        let received: MigrationHeader = receive_message(&mut b).await.unwrap();
        assert_eq!(received.fs_type, "dir");
        assert_eq!(received.snapshot_names, vec!["snap0".to_string()]);
    }

    #[tokio::test]
    async fn control_handshake_carries_failure_messages() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let control = MigrationControl {
            success: false,
            message: "rsync transfer failed".to_string(),
        };
        send_message(&mut a, &control).await.unwrap();
        let received: MigrationControl = receive_message(&mut b).await.unwrap();
        assert!(!received.success);
        assert_eq!(received.message, "rsync transfer failed");
    }
}
