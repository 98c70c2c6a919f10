//! Element resolution: ranking tree nodes against a locator query.
//!
//! A literal query without an index first tries a fast exact-clickable search
//! that prefers button classes. Everything else goes through the scored path:
//! exact (1000) > regex (500) > substring (0), plus clickable and class
//! bonuses. An index selects from traversal order and ignores scores.

use regex::Regex;
use tracing::debug;

use crate::hierarchy::UiNode;

/// Marker prefix for regex queries
pub const REGEX_PREFIX: &str = "regexp:";

const EXACT_SCORE: i32 = 1000;
const REGEX_SCORE: i32 = 500;
const CLICKABLE_BONUS: i32 = 100;

/// A parsed locator query
#[derive(Debug, Clone)]
pub enum Query {
    /// Case-insensitive literal
    Literal { raw: String, lower: String },
    /// Case-sensitive pattern search; `None` when the pattern failed to compile
    Pattern { raw: String, regex: Option<Regex> },
}

impl Query {
    pub fn parse(raw: &str) -> Query {
        match raw.strip_prefix(REGEX_PREFIX) {
            Some(pattern) => {
                let regex = Regex::new(pattern)
                    .map_err(|e| debug!(pattern, error = %e, "invalid locator regex"))
                    .ok();
                Query::Pattern {
                    raw: raw.to_string(),
                    regex,
                }
            }
            None => Query::Literal {
                raw: raw.to_string(),
                lower: raw.to_lowercase(),
            },
        }
    }

    /// The query as written, including any `regexp:` prefix
    pub fn raw(&self) -> &str {
        match self {
            Query::Literal { raw, .. } | Query::Pattern { raw, .. } => raw,
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, Query::Pattern { .. })
    }
}

/// How a node matched a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Regex,
    Substring,
}

impl MatchKind {
    fn weight(self) -> i32 {
        match self {
            MatchKind::Exact => EXACT_SCORE,
            MatchKind::Regex => REGEX_SCORE,
            MatchKind::Substring => 0,
        }
    }
}

/// A scored candidate, in traversal order
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub node: &'a UiNode,
    pub kind: MatchKind,
    pub score: i32,
}

/// Resolve `query` against `root`. Returns `None` when nothing matches.
pub fn resolve<'a>(root: &'a UiNode, query: &Query, index: Option<usize>) -> Option<&'a UiNode> {
    if let (Query::Literal { lower, .. }, None) = (query, index) {
        if let Some(node) = fast_path(root, lower) {
            return Some(node);
        }
    }

    let candidates = collect_candidates(root, query);
    if let Some(i) = index {
        return candidates.get(i).map(|c| c.node);
    }

    let best = candidates
        .iter()
        .fold(None::<&Candidate<'a>>, |best, c| match best {
            Some(b) if b.score >= c.score => Some(b),
            _ => Some(c),
        })?;
    if candidates.len() > 1 {
        debug!(
            query = query.raw(),
            matched = %best.node.label(),
            score = best.score,
            total = candidates.len(),
            "ambiguous locator resolved by score"
        );
    }
    Some(best.node)
}

/// Convenience wrapper parsing `raw` first
pub fn resolve_str<'a>(root: &'a UiNode, raw: &str, index: Option<usize>) -> Option<&'a UiNode> {
    resolve(root, &Query::parse(raw), index)
}

/// Depth-first search for a clickable node whose text or hint equals the
/// query. A button class wins immediately; otherwise the first match is the
/// backup.
fn fast_path<'a>(root: &'a UiNode, lower: &str) -> Option<&'a UiNode> {
    let mut backup: Option<&'a UiNode> = None;
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        if node.bounds.is_some() && !node.has_area() {
            continue;
        }
        if node.clickable
            && node.has_area()
            && (node.text.to_lowercase() == lower || node.hint.to_lowercase() == lower)
        {
            if node.class_name.contains("Button") {
                return Some(node);
            }
            backup.get_or_insert(node);
        }
        stack.extend(node.children.iter().rev());
    }
    backup
}

/// Every matching node with positive area, in traversal order
pub fn collect_candidates<'a>(root: &'a UiNode, query: &Query) -> Vec<Candidate<'a>> {
    let mut out = Vec::new();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        match node.bounds {
            Some(b) if !b.has_area() => continue,
            Some(_) => {
                if let Some(kind) = classify(node, query) {
                    out.push(Candidate {
                        node,
                        kind,
                        score: score(node, kind),
                    });
                }
            }
            None => {}
        }
        stack.extend(node.children.iter().rev());
    }
    out
}

fn classify(node: &UiNode, query: &Query) -> Option<MatchKind> {
    let fields = node.locator_fields();
    match query {
        Query::Pattern { regex, .. } => {
            let regex = regex.as_ref()?;
            fields
                .iter()
                .any(|f| !f.is_empty() && regex.is_match(f))
                .then_some(MatchKind::Regex)
        }
        Query::Literal { lower, .. } => {
            let lowered: Vec<String> = fields
                .iter()
                .filter(|f| !f.is_empty())
                .map(|f| f.to_lowercase())
                .collect();
            if lowered.iter().any(|f| f == lower) {
                Some(MatchKind::Exact)
            } else if lowered.iter().any(|f| f.contains(lower.as_str())) {
                Some(MatchKind::Substring)
            } else {
                None
            }
        }
    }
}

fn score(node: &UiNode, kind: MatchKind) -> i32 {
    let mut score = kind.weight();
    if node.clickable {
        score += CLICKABLE_BONUS;
    }
    score + class_bonus(&node.class_name)
}

fn class_bonus(class: &str) -> i32 {
    if class.contains("Button") {
        50
    } else if class.contains("EditText") || class.contains("Input") {
        40
    } else if class.contains("ImageButton") || class.contains("ImageView") {
        30
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::Bounds;

    fn node(text: &str, class: &str, clickable: bool, bounds: Option<Bounds>) -> UiNode {
        UiNode {
            text: text.to_string(),
            class_name: class.to_string(),
            clickable,
            bounds,
            ..UiNode::default()
        }
    }

    fn b(l: i32, t: i32, r: i32, bt: i32) -> Option<Bounds> {
        Some(Bounds::new(l, t, r, bt))
    }

    fn root(children: Vec<UiNode>) -> UiNode {
        UiNode {
            children,
            ..UiNode::default()
        }
    }

    #[test]
    fn test_fast_path_prefers_button() {
        let tree = root(vec![
            node("Save", "android.widget.TextView", true, b(0, 0, 100, 40)),
            node("Save", "android.widget.Button", true, b(0, 50, 100, 90)),
        ]);
        let found = resolve_str(&tree, "Save", None).unwrap();
        assert_eq!(found.class_name, "android.widget.Button");
    }

    #[test]
    fn test_fast_path_backup_is_first_clickable() {
        let tree = root(vec![
            node("save", "android.widget.TextView", true, b(0, 0, 100, 40)),
            node("SAVE", "android.view.View", true, b(0, 50, 100, 90)),
        ]);
        let found = resolve_str(&tree, "Save", None).unwrap();
        assert_eq!(found.class_name, "android.widget.TextView");
    }

    #[test]
    fn test_zero_area_nodes_are_never_returned() {
        let tree = root(vec![
            node("Save", "android.widget.Button", true, b(10, 10, 10, 50)),
            node("Save draft", "android.widget.TextView", false, b(0, 0, 0, 0)),
        ]);
        assert!(resolve_str(&tree, "Save", None).is_none());
    }

    #[test]
    fn test_zero_area_prunes_subtree() {
        let mut hidden = node("", "android.widget.FrameLayout", false, b(0, 0, 0, 0));
        hidden.children.push(node("Save", "android.widget.Button", true, b(0, 0, 10, 10)));
        let tree = root(vec![hidden]);
        assert!(resolve_str(&tree, "Save", None).is_none());
    }

    #[test]
    fn test_unbounded_containers_are_transparent() {
        let mut container = node("", "android.widget.LinearLayout", false, None);
        container
            .children
            .push(node("Continue", "android.widget.TextView", false, b(0, 0, 10, 10)));
        let tree = root(vec![container]);
        let found = resolve_str(&tree, "continue", None).unwrap();
        assert_eq!(found.text, "Continue");
    }

    #[test]
    fn test_exact_beats_substring() {
        let tree = root(vec![
            node("Login with Google", "android.widget.Button", true, b(0, 0, 10, 10)),
            node("Login", "android.widget.TextView", false, b(0, 20, 10, 30)),
        ]);
        let found = resolve_str(&tree, "Login", None).unwrap();
        assert_eq!(found.text, "Login");
    }

    #[test]
    fn test_resource_id_and_description_match() {
        let mut by_id = node("", "android.widget.ImageView", false, b(0, 0, 10, 10));
        by_id.resource_id = "com.app:id/avatar".into();
        let mut by_desc = node("", "android.view.View", false, b(0, 20, 10, 30));
        by_desc.content_description = "Profile".into();
        let tree = root(vec![by_id, by_desc]);

        assert_eq!(
            resolve_str(&tree, "com.app:id/avatar", None).unwrap().resource_id,
            "com.app:id/avatar"
        );
        assert_eq!(
            resolve_str(&tree, "profile", None).unwrap().content_description,
            "Profile"
        );
    }

    #[test]
    fn test_index_uses_traversal_order() {
        let tree = root(vec![
            node("Item", "android.widget.TextView", false, b(0, 0, 10, 10)),
            node("Item", "android.widget.Button", true, b(0, 20, 10, 30)),
            node("Item", "android.widget.TextView", false, b(0, 40, 10, 50)),
        ]);
        assert_eq!(resolve_str(&tree, "Item", Some(0)).unwrap().bounds, b(0, 0, 10, 10));
        assert_eq!(resolve_str(&tree, "Item", Some(2)).unwrap().bounds, b(0, 40, 10, 50));
        assert!(resolve_str(&tree, "Item", Some(3)).is_none());
    }

    #[test]
    fn test_ties_go_to_first_seen() {
        let tree = root(vec![
            node("Next page", "android.widget.TextView", false, b(0, 0, 10, 10)),
            node("Next step", "android.widget.TextView", false, b(0, 20, 10, 30)),
        ]);
        assert_eq!(resolve_str(&tree, "Next", None).unwrap().text, "Next page");
    }

    #[test]
    fn test_regex_is_case_sensitive() {
        let tree = root(vec![node("Order #42", "android.widget.TextView", false, b(0, 0, 10, 10))]);
        assert!(resolve_str(&tree, "regexp:Order #\\d+", None).is_some());
        assert!(resolve_str(&tree, "regexp:order #\\d+", None).is_none());
        assert!(resolve_str(&tree, "regexp:([", None).is_none());
    }

    #[test]
    fn test_scores() {
        let tree = root(vec![node("Email", "android.widget.EditText", true, b(0, 0, 10, 10))]);
        let candidates = collect_candidates(&tree, &Query::parse("Email"));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, MatchKind::Exact);
        assert_eq!(candidates[0].score, 1000 + 100 + 40);
    }
}
