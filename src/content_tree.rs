//! Arena-backed content tree standing in for the host page.
//!
//! Nodes are elements with a tag, sorted attributes, optional text and ordered
//! children. Appending nodes or replacing children publishes a
//! [`MutationBatch`] to every subscriber, which is what the change watcher
//! consumes.

use crate::errors::{VeilError, VeilResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tokio::sync::mpsc;

/// Handle of a node inside one [`ContentTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
struct Element {
    tag: String,
    attrs: BTreeMap<String, String>,
    text: Option<String>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

/// Nodes added to the tree by one structural change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationBatch {
    pub added: Vec<NodeId>,
}

impl MutationBatch {
    pub fn new(added: Vec<NodeId>) -> Self {
        Self { added }
    }

    pub fn extend(&mut self, other: MutationBatch) {
        self.added.extend(other.added);
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
    }
}

/// Serialized form of a subtree, used for feed snapshots on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedNode {
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FeedNode>,
}

impl FeedNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn child(mut self, child: FeedNode) -> Self {
        self.children.push(child);
        self
    }
}

pub struct ContentTree {
    nodes: Vec<Element>,
    root: NodeId,
    subscribers: Vec<mpsc::UnboundedSender<MutationBatch>>,
}

impl Default for ContentTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentTree {
    pub fn new() -> Self {
        let root = Element {
            tag: "body".to_string(),
            attrs: BTreeMap::new(),
            text: None,
            children: Vec::new(),
            parent: None,
        };
        Self {
            nodes: vec![root],
            root: NodeId(0),
            subscribers: Vec::new(),
        }
    }

    /// Build a tree from a feed snapshot file, each node appended under the root.
    pub fn load_feed<P: AsRef<Path>>(path: P) -> VeilResult<Self> {
        let nodes = read_feed(path)?;
        let mut tree = Self::new();
        let root = tree.root();
        for node in &nodes {
            tree.append_snapshot(root, node)?;
        }
        Ok(tree)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Register a receiver for future mutation batches.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<MutationBatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn publish(&mut self, added: Vec<NodeId>) {
        if added.is_empty() {
            return;
        }
        let batch = MutationBatch::new(added);
        // Closed receivers are pruned on the way.
        self.subscribers.retain(|tx| tx.send(batch.clone()).is_ok());
    }

    fn element(&self, id: NodeId) -> Option<&Element> {
        self.nodes.get(id.0)
    }

    fn element_mut(&mut self, id: NodeId) -> VeilResult<&mut Element> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| VeilError::not_found("node", id.0.to_string()))
    }

    /// Create a detached element.
    pub fn create(&mut self, tag: impl Into<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Element {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            text: None,
            children: Vec::new(),
            parent: None,
        });
        id
    }

    fn build(&mut self, snapshot: &FeedNode) -> NodeId {
        let id = self.create(snapshot.tag.clone());
        if let Some(el) = self.nodes.get_mut(id.0) {
            el.attrs = snapshot.attrs.clone();
            el.text = snapshot.text.clone();
        }
        for child in &snapshot.children {
            let child_id = self.build(child);
            if let Some(el) = self.nodes.get_mut(child_id.0) {
                el.parent = Some(id);
            }
            if let Some(el) = self.nodes.get_mut(id.0) {
                el.children.push(child_id);
            }
        }
        id
    }

    /// Build `snapshot` and append it under `parent` as one mutation.
    pub fn append_snapshot(&mut self, parent: NodeId, snapshot: &FeedNode) -> VeilResult<NodeId> {
        let id = self.build(snapshot);
        self.append_child(parent, id)?;
        Ok(id)
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> VeilResult<()> {
        if parent == child || self.is_ancestor(child, parent) {
            return Err(VeilError::validation("child", "appending would create a cycle"));
        }
        self.detach(child)?;
        self.element_mut(parent)?.children.push(child);
        self.element_mut(child)?.parent = Some(parent);
        self.publish(vec![child]);
        Ok(())
    }

    fn detach(&mut self, id: NodeId) -> VeilResult<()> {
        if let Some(parent) = self.element_mut(id)?.parent.take() {
            self.element_mut(parent)?.children.retain(|c| *c != id);
        }
        Ok(())
    }

    /// Detach and return all children of `id` without publishing a mutation.
    pub fn take_children(&mut self, id: NodeId) -> VeilResult<Vec<NodeId>> {
        let children = std::mem::take(&mut self.element_mut(id)?.children);
        for child in &children {
            self.element_mut(*child)?.parent = None;
        }
        Ok(children)
    }

    /// Replace the children of `id`, publishing the new children as added.
    pub fn replace_children(&mut self, id: NodeId, children: Vec<NodeId>) -> VeilResult<()> {
        for old in self.take_children(id)? {
            self.element_mut(old)?.parent = None;
        }
        for child in &children {
            self.detach(*child)?;
            self.element_mut(*child)?.parent = Some(id);
        }
        self.element_mut(id)?.children = children.clone();
        self.publish(children);
        Ok(())
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|el| el.tag.as_str())
    }

    pub fn attr(&self, id: NodeId, key: &str) -> Option<&str> {
        self.element(id)
            .and_then(|el| el.attrs.get(key))
            .map(String::as_str)
    }

    pub fn set_attr(&mut self, id: NodeId, key: impl Into<String>, value: impl Into<String>) -> VeilResult<()> {
        self.element_mut(id)?.attrs.insert(key.into(), value.into());
        Ok(())
    }

    pub fn remove_attr(&mut self, id: NodeId, key: &str) -> VeilResult<()> {
        self.element_mut(id)?.attrs.remove(key);
        Ok(())
    }

    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.attr(id, "class")
            .map(|classes| classes.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        self.element(id).and_then(|el| el.text.as_deref())
    }

    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) -> VeilResult<()> {
        self.element_mut(id)?.text = Some(text.into());
        Ok(())
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.element(id).map(|el| el.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.element(id).and_then(|el| el.parent)
    }

    /// Ancestors of `id`, nearest first, excluding `id`.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.parent(id);
        while let Some(node) = cursor {
            out.push(node);
            cursor = self.parent(node);
        }
        out
    }

    fn is_ancestor(&self, candidate: NodeId, of: NodeId) -> bool {
        self.ancestors(of).contains(&candidate)
    }

    /// Descendants of `id` in document order, excluding `id`.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).iter().rev().copied());
        }
        out
    }

    /// Concatenated text of `id` and its descendants, in document order.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        if let Some(text) = self.text(id) {
            out.push_str(text);
        }
        for node in self.descendants(id) {
            if let Some(text) = self.text(node) {
                out.push_str(text);
            }
        }
        out
    }

    /// True if `id` is reachable from the root.
    pub fn is_attached(&self, id: NodeId) -> bool {
        id == self.root || self.ancestors(id).last() == Some(&self.root)
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        if let Some(text) = self.text(id) {
            out.push_str(&escape(text));
        }
        for child in self.children(id) {
            self.render(*child, &mut out);
        }
        out
    }

    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.render(id, &mut out);
        out
    }

    fn render(&self, id: NodeId, out: &mut String) {
        let Some(el) = self.element(id) else {
            return;
        };
        out.push('<');
        out.push_str(&el.tag);
        for (key, value) in &el.attrs {
            let _ = write!(out, " {}=\"{}\"", key, escape(value));
        }
        out.push('>');
        if let Some(text) = &el.text {
            out.push_str(&escape(text));
        }
        for child in &el.children {
            self.render(*child, out);
        }
        let _ = write!(out, "</{}>", el.tag);
    }
}

/// Parse a feed snapshot file: either a single node or an array of nodes.
pub fn read_feed<P: AsRef<Path>>(path: P) -> VeilResult<Vec<FeedNode>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| VeilError::io(format!("reading feed {}", path.display()), e))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| VeilError::serialization("feed snapshot", e))?;
    if value.is_array() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
