//! Flood target selection: split horizon and path-based loop suppression.

use crate::core::NodeId;
use crate::peer::{Peer, PeerState};

/// Pick the peers a delta must be forwarded to.
///
/// Only initialized peers receive floods. The sender (when split horizon
/// is on) and every node already on the publication's path are skipped;
/// peer names double as node ids, which is what makes both checks cheap.
pub fn flood_targets<'a>(
    peers: impl Iterator<Item = (&'a String, &'a Peer)>,
    sender: Option<&NodeId>,
    node_path: &[NodeId],
    split_horizon: bool,
) -> Vec<String> {
    peers
        .filter(|(_, peer)| peer.state == PeerState::Initialized)
        .filter(|(name, _)| {
            if split_horizon {
                if let Some(sender) = sender {
                    if sender.as_str() == name.as_str() {
                        return false;
                    }
                }
            }
            !node_path.iter().any(|node| node.as_str() == name.as_str())
        })
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, PeerSpec};
    use std::collections::BTreeMap;

    fn peer(state: PeerState) -> Peer {
        let mut peer = Peer::new(
            PeerSpec::new("127.0.0.1:1"),
            BackoffConfig::default(),
            1,
        );
        peer.state = state;
        peer
    }

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    fn peers(entries: &[(&str, PeerState)]) -> BTreeMap<String, Peer> {
        entries
            .iter()
            .map(|(name, state)| (name.to_string(), peer(*state)))
            .collect()
    }

    #[test]
    fn floods_only_initialized_peers() {
        let peers = peers(&[
            ("node-2", PeerState::Initialized),
            ("node-3", PeerState::Syncing),
            ("node-4", PeerState::Idle),
        ]);
        let targets = flood_targets(peers.iter(), None, &[], true);
        assert_eq!(targets, vec!["node-2".to_string()]);
    }

    #[test]
    fn split_horizon_skips_the_sender() {
        let peers = peers(&[
            ("node-2", PeerState::Initialized),
            ("node-3", PeerState::Initialized),
        ]);
        let sender = node("node-2");
        let targets = flood_targets(peers.iter(), Some(&sender), &[], true);
        assert_eq!(targets, vec!["node-3".to_string()]);

        // optimization off: sender is flooded again, path still suppresses
        let targets = flood_targets(peers.iter(), Some(&sender), &[], false);
        assert_eq!(
            targets,
            vec!["node-2".to_string(), "node-3".to_string()]
        );
    }

    #[test]
    fn node_path_suppresses_loops() {
        let peers = peers(&[
            ("node-2", PeerState::Initialized),
            ("node-3", PeerState::Initialized),
        ]);
        let path = [node("node-3"), node("node-1")];
        let targets = flood_targets(peers.iter(), None, &path, true);
        assert_eq!(targets, vec!["node-2".to_string()]);

        let targets = flood_targets(peers.iter(), None, &path, false);
        assert_eq!(targets, vec!["node-2".to_string()]);
    }
}
