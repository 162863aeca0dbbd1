//! Incremental change observation over the content tree.

use crate::config_loader::WatcherConfig;
use crate::content_tree::{ContentTree, MutationBatch, NodeId};
use crate::errors::VeilResult;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Marker attribute set on content nodes once they have been scanned.
pub const PROCESSED_ATTR: &str = "data-veil-processed";

/// Accumulates mutation batches until a quiet window has passed since the
/// last one. Merged state survives cancellation of whatever future polls it.
#[derive(Debug)]
pub struct Debounce {
    window: Duration,
    pending: Option<MutationBatch>,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    pub fn push(&mut self, batch: MutationBatch) {
        match &mut self.pending {
            Some(merged) => merged.extend(batch),
            None => self.pending = Some(batch),
        }
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending batch becomes due. Now if nothing is pending.
    pub fn deadline(&self) -> Instant {
        self.deadline.unwrap_or_else(Instant::now)
    }

    pub fn take(&mut self) -> Option<MutationBatch> {
        self.deadline = None;
        self.pending.take()
    }
}

pub struct ChangeWatcher {
    item_tag: String,
    debounce: Duration,
}

impl ChangeWatcher {
    pub fn new(item_tag: impl Into<String>, debounce: Duration) -> Self {
        Self {
            item_tag: item_tag.into(),
            debounce,
        }
    }

    pub fn from_config(config: &WatcherConfig) -> Self {
        Self::new(config.item_tag.clone(), Duration::from_millis(config.debounce_ms))
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Resolve added nodes to unprocessed, attached content nodes, in
    /// discovery order without duplicates.
    pub fn content_nodes(&self, tree: &ContentTree, batch: &MutationBatch) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for added in &batch.added {
            for candidate in self.resolve(tree, *added) {
                if seen.insert(candidate)
                    && tree.is_attached(candidate)
                    && !Self::is_processed(tree, candidate)
                {
                    out.push(candidate);
                }
            }
        }
        out
    }

    /// Every content node currently in the tree, for an initial full pass.
    pub fn initial_nodes(&self, tree: &ContentTree) -> Vec<NodeId> {
        let batch = MutationBatch::new(vec![tree.root()]);
        self.content_nodes(tree, &batch)
    }

    fn is_item(&self, tree: &ContentTree, node: NodeId) -> bool {
        tree.tag(node) == Some(self.item_tag.as_str())
    }

    fn resolve(&self, tree: &ContentTree, added: NodeId) -> Vec<NodeId> {
        if self.is_item(tree, added) {
            return vec![added];
        }
        // A late child of an existing item re-delivers that item.
        if let Some(owner) = tree.ancestors(added).into_iter().find(|a| self.is_item(tree, *a)) {
            return vec![owner];
        }
        tree.descendants(added)
            .into_iter()
            .filter(|n| self.is_item(tree, *n))
            .collect()
    }

    pub fn is_processed(tree: &ContentTree, node: NodeId) -> bool {
        tree.attr(node, PROCESSED_ATTR).is_some()
    }

    pub fn mark_processed(tree: &mut ContentTree, node: NodeId) -> VeilResult<()> {
        tree.set_attr(node, PROCESSED_ATTR, "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_tree::FeedNode;

    fn watcher() -> ChangeWatcher {
        ChangeWatcher::new("article", Duration::from_millis(200))
    }

    fn post() -> FeedNode {
        FeedNode::new("article").child(FeedNode::new("img").attr("src", "https://cdn/a.jpg"))
    }

    #[test]
    fn resolves_wrappers_and_late_children() {
        let mut tree = ContentTree::new();
        let root = tree.root();
        let wrapper = tree
            .append_snapshot(root, &FeedNode::new("div").child(post()).child(post()))
            .unwrap();
        let nodes = watcher().content_nodes(&tree, &MutationBatch::new(vec![wrapper]));
        assert_eq!(nodes.len(), 2);

        let article = nodes[0];
        let late = tree.create("span");
        tree.append_child(article, late).unwrap();
        let again = watcher().content_nodes(&tree, &MutationBatch::new(vec![late]));
        assert_eq!(again, vec![article]);
    }

    #[test]
    fn processed_and_detached_nodes_are_filtered() {
        let mut tree = ContentTree::new();
        let root = tree.root();
        let a = tree.append_snapshot(root, &post()).unwrap();
        let b = tree.append_snapshot(root, &post()).unwrap();
        ChangeWatcher::mark_processed(&mut tree, a).unwrap();
        let detached = tree.create("article");

        let batch = MutationBatch::new(vec![a, b, b, detached]);
        assert_eq!(watcher().content_nodes(&tree, &batch), vec![b]);
    }

    #[test]
    fn initial_nodes_cover_whole_tree() {
        let mut tree = ContentTree::new();
        let root = tree.root();
        tree.append_snapshot(root, &post()).unwrap();
        tree.append_snapshot(root, &FeedNode::new("div").child(post())).unwrap();
        assert_eq!(watcher().initial_nodes(&tree).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_deadline_moves_with_each_push() {
        let mut debounce = Debounce::new(Duration::from_millis(200));
        assert!(!debounce.is_pending());
        let start = Instant::now();
        debounce.push(MutationBatch::default());
        assert_eq!(debounce.deadline(), start + Duration::from_millis(200));

        tokio::time::advance(Duration::from_millis(150)).await;
        debounce.push(MutationBatch::default());
        assert_eq!(debounce.deadline(), start + Duration::from_millis(350));
        assert!(debounce.take().is_some());
        assert!(!debounce.is_pending());
    }
}
