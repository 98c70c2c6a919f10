//! Normalized UI tree.
//!
//! Both the uiautomator XML dump and the external JSON hierarchy are parsed
//! into the same [`UiNode`] shape.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

static BOUNDS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]").expect("valid regex"));

/// Pixel rectangle of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub width: i32,
    pub height: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            width: right - left,
            height: bottom - top,
        }
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    /// Positive width and height
    pub fn has_area(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Euclidean distance between the centers of two rectangles
    pub fn center_distance(&self, other: &Bounds) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        let dx = f64::from(ax - bx);
        let dy = f64::from(ay - by);
        (dx * dx + dy * dy).sqrt()
    }
}

impl std::fmt::Display for Bounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{},{}][{},{}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

/// Parse `[l,t][r,b]`
pub fn parse_bounds(raw: &str) -> Option<Bounds> {
    let caps = BOUNDS_RE.captures(raw)?;
    let n = |i: usize| caps[i].parse::<i32>().ok();
    Some(Bounds::new(n(1)?, n(2)?, n(3)?, n(4)?))
}

fn default_true() -> bool {
    true
}

/// One node of a normalized UI tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiNode {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub content_description: String,
    #[serde(default)]
    pub hint: String,
    #[serde(default)]
    pub checkable: bool,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub clickable: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub focusable: bool,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub scrollable: bool,
    #[serde(default)]
    pub long_clickable: bool,
    #[serde(default)]
    pub password: bool,
    #[serde(default)]
    pub selected: bool,
    #[serde(default)]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub children: Vec<UiNode>,
}

impl Default for UiNode {
    fn default() -> Self {
        Self {
            text: String::new(),
            resource_id: String::new(),
            class_name: String::new(),
            package_name: String::new(),
            content_description: String::new(),
            hint: String::new(),
            checkable: false,
            checked: false,
            clickable: false,
            enabled: true,
            focusable: false,
            focused: false,
            scrollable: false,
            long_clickable: false,
            password: false,
            selected: false,
            bounds: None,
            children: Vec::new(),
        }
    }
}

impl UiNode {
    /// Empty container node
    pub fn empty() -> Self {
        Self::default()
    }

    /// Bounds with positive area, if any
    pub fn area_bounds(&self) -> Option<Bounds> {
        self.bounds.filter(Bounds::has_area)
    }

    pub fn has_area(&self) -> bool {
        self.area_bounds().is_some()
    }

    /// Has text or a resource id worth remembering
    pub fn is_identifiable(&self) -> bool {
        !self.text.is_empty() || !self.resource_id.is_empty()
    }

    /// The four fields a locator query is matched against, in match order
    pub fn locator_fields(&self) -> [&str; 4] {
        [
            &self.text,
            &self.hint,
            &self.resource_id,
            &self.content_description,
        ]
    }

    /// Pre-order traversal of the tree, including `self`
    pub fn iter(&self) -> PreOrder<'_> {
        PreOrder { stack: vec![self] }
    }

    /// Short human-readable label used in logs and diagnoses
    pub fn label(&self) -> String {
        let short_class = self.class_name.rsplit('.').next().unwrap_or_default();
        let name = [&self.text, &self.content_description, &self.resource_id]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or("<unlabeled>");
        format!("{}('{}')", short_class, name)
    }

    // ------------------------------------------------------------------------
    // Parsing
    // ------------------------------------------------------------------------

    /// Parse a uiautomator dump. Leading log noise and trailing garbage are ignored.
    pub fn from_uiautomator_xml(raw: &str) -> Result<UiNode, String> {
        let start = raw
            .find("<?xml")
            .or_else(|| raw.find("<hierarchy"))
            .ok_or_else(|| "no XML document in dump output".to_string())?;
        let end = raw
            .rfind("</hierarchy>")
            .map(|i| i + "</hierarchy>".len())
            .filter(|&e| e > start)
            .or_else(|| {
                raw[start..]
                    .trim_end()
                    .ends_with("/>")
                    .then(|| raw.trim_end().len())
            })
            .ok_or_else(|| "truncated hierarchy dump".to_string())?;

        let doc = roxmltree::Document::parse(&raw[start..end]).map_err(|e| e.to_string())?;
        Ok(Self::from_xml_element(doc.root_element()))
    }

    fn from_xml_element(el: roxmltree::Node<'_, '_>) -> UiNode {
        let attr = |name: &str| el.attribute(name).unwrap_or_default().to_string();
        let flag = |name: &str| el.attribute(name) == Some("true");

        UiNode {
            text: attr("text"),
            resource_id: attr("resource-id"),
            class_name: attr("class"),
            package_name: attr("package"),
            content_description: attr("content-desc"),
            hint: attr("hint"),
            checkable: flag("checkable"),
            checked: flag("checked"),
            clickable: flag("clickable"),
            enabled: el.attribute("enabled") != Some("false"),
            focusable: flag("focusable"),
            focused: flag("focused"),
            scrollable: flag("scrollable"),
            long_clickable: flag("long-clickable"),
            password: flag("password"),
            selected: flag("selected"),
            bounds: el.attribute("bounds").and_then(parse_bounds),
            children: el
                .children()
                .filter(|c| c.is_element())
                .map(Self::from_xml_element)
                .collect(),
        }
    }

    /// Parse the external hierarchy schema: `{"attributes": {...}, "children": [...]}`
    pub fn from_external_json(raw: &str) -> Result<UiNode, String> {
        let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        if !value.is_object() {
            return Err("external hierarchy is not a JSON object".to_string());
        }
        Ok(Self::from_external_value(&value))
    }

    fn from_external_value(value: &Value) -> UiNode {
        let attrs = &value["attributes"];
        let attr = |name: &str| match &attrs[name] {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let flag = |name: &str, default: bool| match &attrs[name] {
            Value::Bool(b) => *b,
            Value::String(s) => s == "true",
            _ => default,
        };
        let bounds = match &attrs["bounds"] {
            Value::String(s) => parse_bounds(s),
            obj @ Value::Object(_) => serde_json::from_value::<Bounds>(obj.clone()).ok(),
            _ => None,
        };

        UiNode {
            text: attr("text"),
            resource_id: attr("resource-id"),
            class_name: attr("class"),
            package_name: attr("package"),
            content_description: first_non_empty(attr("content-desc"), attr("accessibilityText")),
            hint: first_non_empty(attr("hint"), attr("hintText")),
            checkable: flag("checkable", false),
            checked: flag("checked", false),
            clickable: flag("clickable", false),
            enabled: flag("enabled", true),
            focusable: flag("focusable", false),
            focused: flag("focused", false),
            scrollable: flag("scrollable", false),
            long_clickable: flag("long-clickable", false),
            password: flag("password", false),
            selected: flag("selected", false),
            bounds,
            children: value["children"]
                .as_array()
                .map(|children| children.iter().map(Self::from_external_value).collect())
                .unwrap_or_default(),
        }
    }
}

fn first_non_empty(a: String, b: String) -> String {
    if a.is_empty() { b } else { a }
}

/// Pre-order iterator over a tree
pub struct PreOrder<'a> {
    stack: Vec<&'a UiNode>,
}

impl<'a> Iterator for PreOrder<'a> {
    type Item = &'a UiNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Structural fingerprint: SHA-256 of the pre-order `class:text:resource_id` sequence
pub fn screen_hash(root: &UiNode) -> String {
    let structure: Vec<String> = root
        .iter()
        .map(|n| format!("{}:{}:{}", n.class_name, n.text, n.resource_id))
        .collect();
    format!("{:x}", Sha256::digest(structure.join("|").as_bytes()))
}
