//! Reversible concealment of content nodes.
//!
//! Concealing detaches a node's children into a side table and installs a
//! placeholder. The node itself stays in the tree so later scans still see its
//! processed marker.

use crate::config_loader::MutatorConfig;
use crate::content_tree::{ContentTree, NodeId};
use crate::decision::Identity;
use crate::errors::VeilResult;
use std::collections::HashMap;
use tracing::debug;

pub const PLACEHOLDER_CLASS: &str = "veil-placeholder";
pub const REVEAL_CLASS: &str = "veil-reveal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Unprocessed,
    Safe,
    Concealed,
    TemporarilyRevealed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewportEvent {
    Scroll { delta_px: i64 },
    Navigation,
}

#[derive(Debug)]
struct ConcealedContent {
    children: Vec<NodeId>,
    placeholder: NodeId,
}

pub struct Mutator {
    placeholder_text: String,
    reveal_label: String,
    reconceal_scroll_px: u32,
    states: HashMap<NodeId, ItemState>,
    originals: HashMap<Identity, HashMap<NodeId, ConcealedContent>>,
    identities: HashMap<NodeId, Identity>,
}

impl Mutator {
    pub fn new(config: &MutatorConfig) -> Self {
        Self {
            placeholder_text: config.placeholder_text.clone(),
            reveal_label: config.reveal_label.clone(),
            reconceal_scroll_px: config.reconceal_scroll_px,
            states: HashMap::new(),
            originals: HashMap::new(),
            identities: HashMap::new(),
        }
    }

    pub fn state(&self, node: NodeId) -> ItemState {
        self.states.get(&node).copied().unwrap_or(ItemState::Unprocessed)
    }

    /// Returns true if the node transitioned into `Concealed`.
    pub fn conceal(&mut self, tree: &mut ContentTree, node: NodeId, identity: &Identity) -> VeilResult<bool> {
        match self.state(node) {
            ItemState::Concealed => Ok(false),
            ItemState::TemporarilyRevealed => {
                let placeholder = self.stored(identity, node).map(|c| c.placeholder);
                match placeholder {
                    Some(placeholder) => tree.replace_children(node, vec![placeholder])?,
                    None => self.install_placeholder(tree, node, identity)?,
                }
                self.states.insert(node, ItemState::Concealed);
                Ok(true)
            }
            ItemState::Unprocessed | ItemState::Safe => {
                self.install_placeholder(tree, node, identity)?;
                self.states.insert(node, ItemState::Concealed);
                debug!(identity = %identity.fingerprint(), node = node.index(), "concealed");
                Ok(true)
            }
        }
    }

    fn install_placeholder(&mut self, tree: &mut ContentTree, node: NodeId, identity: &Identity) -> VeilResult<()> {
        let children = tree.take_children(node)?;
        let placeholder = tree.create("div");
        tree.set_attr(placeholder, "class", PLACEHOLDER_CLASS)?;
        tree.set_text(placeholder, self.placeholder_text.clone())?;
        let button = tree.create("button");
        tree.set_attr(button, "class", REVEAL_CLASS)?;
        tree.set_text(button, self.reveal_label.clone())?;
        tree.append_child(placeholder, button)?;
        tree.replace_children(node, vec![placeholder])?;

        self.originals
            .entry(identity.clone())
            .or_default()
            .insert(node, ConcealedContent { children, placeholder });
        self.identities.insert(node, identity.clone());
        Ok(())
    }

    fn stored(&self, identity: &Identity, node: NodeId) -> Option<&ConcealedContent> {
        self.originals.get(identity).and_then(|by_node| by_node.get(&node))
    }

    /// User-triggered reveal. Only a concealed node can be revealed, and it
    /// goes back under the placeholder on the next significant viewport event.
    pub fn reveal(&mut self, tree: &mut ContentTree, node: NodeId) -> VeilResult<bool> {
        if self.state(node) != ItemState::Concealed {
            return Ok(false);
        }
        let Some(identity) = self.identities.get(&node).cloned() else {
            return Ok(false);
        };
        let Some(children) = self.stored(&identity, node).map(|c| c.children.clone()) else {
            return Ok(false);
        };
        tree.replace_children(node, children)?;
        self.states.insert(node, ItemState::TemporarilyRevealed);
        Ok(true)
    }

    /// Permanently restore a node whose decision no longer conceals. A node
    /// that was never concealed is just marked `Safe`.
    pub fn release(&mut self, tree: &mut ContentTree, node: NodeId) -> VeilResult<bool> {
        let state = self.state(node);
        if !matches!(state, ItemState::Concealed | ItemState::TemporarilyRevealed) {
            self.states.insert(node, ItemState::Safe);
            return Ok(false);
        }
        let stored = self.identities.remove(&node).and_then(|identity| {
            let by_node = self.originals.get_mut(&identity)?;
            let content = by_node.remove(&node);
            if by_node.is_empty() {
                self.originals.remove(&identity);
            }
            content
        });
        if state == ItemState::Concealed {
            if let Some(content) = stored {
                tree.replace_children(node, content.children)?;
            }
        }
        self.states.insert(node, ItemState::Safe);
        Ok(true)
    }

    pub fn is_significant(&self, event: &ViewportEvent) -> bool {
        match event {
            ViewportEvent::Navigation => true,
            ViewportEvent::Scroll { delta_px } => delta_px.unsigned_abs() >= u64::from(self.reconceal_scroll_px),
        }
    }

    /// Re-conceal every temporarily revealed node after a significant event.
    /// Returns the number of nodes re-concealed.
    pub fn on_viewport(&mut self, tree: &mut ContentTree, event: &ViewportEvent) -> VeilResult<usize> {
        if !self.is_significant(event) {
            return Ok(0);
        }
        let revealed: Vec<(NodeId, Identity)> = self
            .states
            .iter()
            .filter(|(_, state)| **state == ItemState::TemporarilyRevealed)
            .filter_map(|(node, _)| self.identities.get(node).map(|id| (*node, id.clone())))
            .collect();
        let mut count = 0;
        for (node, identity) in revealed {
            if self.conceal(tree, node, &identity)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Node ids currently in `state`.
    pub fn nodes_in(&self, state: ItemState) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(node, _)| *node)
            .collect();
        nodes.sort();
        nodes
    }
}
