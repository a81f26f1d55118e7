//! Places an instance on a swarm node whose OS family matches the image.

use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PlacementError {
    #[error(
        "no suitable node for image '{image}'. \
         Label your swarm nodes before retrying, e.g. \
         docker node update --label-add \"name=linux-1\" $(docker node ls -q)"
    )]
    NoSuitableNode { image: String },
}

/// Picks a node name label for `image`. Windows-tagged images only land on
/// `windows*` labels, everything else on the rest. An image reference
/// without a tag is malformed for this check and rejected.
pub fn choose_node(image: &str, nodes: &[String]) -> Result<String, PlacementError> {
    let (win_nodes, linux_nodes): (Vec<&String>, Vec<&String>) = nodes
        .iter()
        .filter(|node| !node.is_empty())
        .partition(|node| node.starts_with("windows"));

    let no_suitable_node = || PlacementError::NoSuitableNode {
        image: image.to_string(),
    };

    let tag = match image.split_once(':') {
        Some((_, tag)) => tag,
        None => return Err(no_suitable_node()),
    };

    let candidates = if tag.starts_with("windows") {
        win_nodes
    } else {
        linux_nodes
    };

    candidates
        .choose(&mut rand::thread_rng())
        .map(|node| node.to_string())
        .ok_or_else(no_suitable_node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn linux_image_never_lands_on_windows_node() {
        let nodes = nodes(&["linux-1", "linux-2", "windows-1"]);
        for _ in 0..50 {
            let node = choose_node("registry.local/web:latest", &nodes).unwrap();
            assert!(!node.starts_with("windows"));
        }
    }

    #[test]
    fn windows_image_only_lands_on_windows_nodes() {
        let nodes = nodes(&["linux-1", "windows-1", "windows-2"]);
        for _ in 0..50 {
            let node = choose_node("registry.local/iis:windowsservercore", &nodes).unwrap();
            assert!(node.starts_with("windows"));
        }
    }

    #[test]
    fn empty_matching_set_is_an_error() {
        let only_linux = nodes(&["linux-1"]);
        let err = choose_node("iis:windowsservercore", &only_linux).unwrap_err();
        assert!(err.to_string().contains("label"));

        let only_windows = nodes(&["windows-1"]);
        assert!(choose_node("web:latest", &only_windows).is_err());
    }

    #[test]
    fn untagged_image_is_rejected() {
        let nodes = nodes(&["linux-1"]);
        assert_eq!(
            choose_node("registry.local/web", &nodes),
            Err(PlacementError::NoSuitableNode {
                image: "registry.local/web".to_string()
            })
        );
    }

    #[test]
    fn blank_labels_are_ignored() {
        let nodes = nodes(&["", "linux-1"]);
        assert_eq!(choose_node("web:latest", &nodes).unwrap(), "linux-1");
    }
}
