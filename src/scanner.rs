//! Item extraction from content nodes.
//!
//! Each content node is probed with an ordered list of image strategies; the
//! first one yielding a non-empty `src` supplies the item identity. Captions
//! use their own ordered strategies and are bounded for display safety.

use crate::config_loader::ScannerConfig;
use crate::content_tree::{ContentTree, NodeId};
use crate::decision::Identity;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref LIKE_COUNTER: Regex =
        Regex::new(r"(?i)^\d+\s*(likes?|others?)$").expect("static like-counter pattern");
}

pub const TRUNCATION_MARKER: &str = "...";

/// A content item discovered in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub identity: Identity,
    pub caption: Option<String>,
    pub alt_text: Option<String>,
    pub node: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageStrategy {
    /// First `img` under an element carrying `class`.
    MediaContainer { class: String },
    /// First `img` whose alt text starts with `prefix`.
    AltPrefix { prefix: String },
    /// First sizeable `img` whose alt does not contain `excluded_alt`.
    Heuristic { excluded_alt: String, min_width: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptionStrategy {
    /// Text of the first element carrying `class`.
    Marked { class: String },
    /// First element carrying `class` whose text looks like prose rather than
    /// a username, location, timestamp or like counter.
    Filtered {
        class: String,
        min_len: usize,
        skip_link_fragment: String,
    },
}

pub struct ItemScanner {
    image_strategies: Vec<ImageStrategy>,
    caption_strategies: Vec<CaptionStrategy>,
    caption_limit: usize,
}

impl ItemScanner {
    pub fn new(
        image_strategies: Vec<ImageStrategy>,
        caption_strategies: Vec<CaptionStrategy>,
        caption_limit: usize,
    ) -> Self {
        Self {
            image_strategies,
            caption_strategies,
            caption_limit,
        }
    }

    pub fn from_config(config: &ScannerConfig) -> Self {
        Self::new(
            vec![
                ImageStrategy::MediaContainer {
                    class: config.media_class.clone(),
                },
                ImageStrategy::AltPrefix {
                    prefix: config.alt_prefix.clone(),
                },
                ImageStrategy::Heuristic {
                    excluded_alt: config.excluded_alt.clone(),
                    min_width: config.min_image_width,
                },
            ],
            vec![
                CaptionStrategy::Marked {
                    class: config.caption_marker_class.clone(),
                },
                CaptionStrategy::Filtered {
                    class: config.caption_class.clone(),
                    min_len: config.caption_min_len,
                    skip_link_fragment: config.skip_link_fragment.clone(),
                },
            ],
            config.caption_limit,
        )
    }

    /// Returns `None` when no strategy yields an identity.
    pub fn scan(&self, tree: &ContentTree, node: NodeId) -> Option<Item> {
        let image = self
            .image_strategies
            .iter()
            .find_map(|strategy| find_image(tree, node, strategy))?;
        let identity = Identity::new(tree.attr(image, "src")?)?;
        let alt_text = tree
            .attr(image, "alt")
            .map(str::trim)
            .filter(|alt| !alt.is_empty())
            .map(str::to_string);
        let caption = self
            .caption_strategies
            .iter()
            .find_map(|strategy| find_caption(tree, node, strategy))
            .map(|text| truncate(&text, self.caption_limit));

        Some(Item {
            identity,
            caption,
            alt_text,
            node,
        })
    }
}

fn has_src(tree: &ContentTree, img: NodeId) -> bool {
    tree.attr(img, "src")
        .map(|src| !src.trim().is_empty())
        .unwrap_or(false)
}

fn images(tree: &ContentTree, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
    tree.descendants(node)
        .into_iter()
        .filter(move |n| tree.tag(*n) == Some("img"))
}

fn find_image(tree: &ContentTree, node: NodeId, strategy: &ImageStrategy) -> Option<NodeId> {
    match strategy {
        ImageStrategy::MediaContainer { class } => {
            let container = tree
                .descendants(node)
                .into_iter()
                .find(|n| tree.has_class(*n, class))?;
            images(tree, container).find(|img| has_src(tree, *img))
        }
        ImageStrategy::AltPrefix { prefix } => images(tree, node).find(|img| {
            has_src(tree, *img)
                && tree
                    .attr(*img, "alt")
                    .map(|alt| alt.starts_with(prefix.as_str()))
                    .unwrap_or(false)
        }),
        ImageStrategy::Heuristic {
            excluded_alt,
            min_width,
        } => images(tree, node).find(|img| {
            let alt = tree.attr(*img, "alt").unwrap_or("");
            let width = tree
                .attr(*img, "width")
                .and_then(|w| w.trim().parse::<u32>().ok());
            !alt.contains(excluded_alt.as_str())
                && has_src(tree, *img)
                && width.map(|w| w > *min_width).unwrap_or(false)
        }),
    }
}

fn find_caption(tree: &ContentTree, node: NodeId, strategy: &CaptionStrategy) -> Option<String> {
    match strategy {
        CaptionStrategy::Marked { class } => tree
            .descendants(node)
            .into_iter()
            .find(|n| tree.has_class(*n, class))
            .map(|n| tree.text_content(n).trim().to_string())
            .filter(|text| !text.is_empty()),
        CaptionStrategy::Filtered {
            class,
            min_len,
            skip_link_fragment,
        } => tree
            .descendants(node)
            .into_iter()
            .filter(|n| tree.has_class(*n, class))
            .find_map(|n| {
                let text = tree.text_content(n).trim().to_string();
                let acceptable = text.chars().count() > *min_len
                    && !inside(tree, n, node, |a| tree.tag(a) == Some("time"))
                    && !inside(tree, n, node, |a| {
                        tree.tag(a) == Some("a")
                            && tree
                                .attr(a, "href")
                                .map(|href| href.contains(skip_link_fragment.as_str()))
                                .unwrap_or(false)
                    })
                    && !LIKE_COUNTER.is_match(&text);
                acceptable.then_some(text)
            }),
    }
}

/// True if some ancestor of `node` below `boundary` satisfies `pred`.
fn inside(tree: &ContentTree, node: NodeId, boundary: NodeId, pred: impl Fn(NodeId) -> bool) -> bool {
    tree.ancestors(node)
        .into_iter()
        .take_while(|a| *a != boundary)
        .any(pred)
}

/// Bound `text` to `limit` chars, appending the truncation marker when cut.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}
