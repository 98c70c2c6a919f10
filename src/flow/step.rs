//! Typed step operations.
//!
//! A raw step (bare name or single-key map) is decoded once into an
//! [`Operation`]; handlers never look at YAML.

use std::fmt;
use std::time::Duration;

use serde_yaml::{Mapping, Value};

use super::FlowError;
use crate::device::keycode;
use crate::healer::LocatorFix;
use crate::resolver::REGEX_PREFIX;

/// Locator keys, in priority order
pub const LOCATOR_KEYS: [&str; 7] = [
    "id",
    "resourceId",
    "text",
    "contentDescription",
    "accessibilityId",
    "label",
    "hint",
];

/// Keys that never carry the query itself
const META_KEYS: [&str; 6] = ["timeout", "optional", "index", "point", "longPress", "direction"];

/// Maestro commands that are recognised but not executed
pub const SKIPPED_COMMANDS: [&str; 18] = [
    "inputRandomText",
    "inputRandomNumber",
    "inputRandomEmail",
    "inputRandomPersonName",
    "assertTrue",
    "clearKeychain",
    "runFlow",
    "repeat",
    "webhook",
    "copyTextFrom",
    "pasteText",
    "evalScript",
    "runScript",
    "startRecording",
    "stopRecording",
    "setLocation",
    "travel",
    "waitForAnimation",
];

pub const DEFAULT_ERASE_CHARS: u32 = 50;
pub const DEFAULT_WAIT_MS: u64 = 1000;
pub const DEFAULT_SWIPE_MS: u64 = 500;
pub const DEFAULT_EXTENDED_WAIT_MS: u64 = 5000;

// ============================================================================
// Operation kinds
// ============================================================================

/// Executable operation kinds, used as registry keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    LaunchApp,
    TapOn,
    DoubleTapOn,
    LongPressOn,
    AssertVisible,
    AssertNotVisible,
    InputText,
    EraseText,
    PressKey,
    Back,
    HideKeyboard,
    Scroll,
    Swipe,
    ScrollUntilVisible,
    Wait,
    WaitForAnimationToEnd,
    ExtendedWaitUntil,
    StopApp,
    ClearState,
    OpenLink,
    TakeScreenshot,
    VolumeUp,
    VolumeDown,
    Skipped,
}

impl OpKind {
    pub const ALL: [OpKind; 24] = [
        OpKind::LaunchApp,
        OpKind::TapOn,
        OpKind::DoubleTapOn,
        OpKind::LongPressOn,
        OpKind::AssertVisible,
        OpKind::AssertNotVisible,
        OpKind::InputText,
        OpKind::EraseText,
        OpKind::PressKey,
        OpKind::Back,
        OpKind::HideKeyboard,
        OpKind::Scroll,
        OpKind::Swipe,
        OpKind::ScrollUntilVisible,
        OpKind::Wait,
        OpKind::WaitForAnimationToEnd,
        OpKind::ExtendedWaitUntil,
        OpKind::StopApp,
        OpKind::ClearState,
        OpKind::OpenLink,
        OpKind::TakeScreenshot,
        OpKind::VolumeUp,
        OpKind::VolumeDown,
        OpKind::Skipped,
    ];

    /// Map a flow command name to its kind; `killApp` is an alias of `stopApp`
    pub fn from_name(name: &str) -> Option<OpKind> {
        let kind = match name {
            "launchApp" => OpKind::LaunchApp,
            "tapOn" => OpKind::TapOn,
            "doubleTapOn" => OpKind::DoubleTapOn,
            "longPressOn" => OpKind::LongPressOn,
            "assertVisible" => OpKind::AssertVisible,
            "assertNotVisible" => OpKind::AssertNotVisible,
            "inputText" => OpKind::InputText,
            "eraseText" => OpKind::EraseText,
            "pressKey" => OpKind::PressKey,
            "back" => OpKind::Back,
            "hideKeyboard" => OpKind::HideKeyboard,
            "scroll" => OpKind::Scroll,
            "swipe" => OpKind::Swipe,
            "scrollUntilVisible" => OpKind::ScrollUntilVisible,
            "wait" => OpKind::Wait,
            "waitForAnimationToEnd" => OpKind::WaitForAnimationToEnd,
            "extendedWaitUntil" => OpKind::ExtendedWaitUntil,
            "stopApp" | "killApp" => OpKind::StopApp,
            "clearState" => OpKind::ClearState,
            "openLink" => OpKind::OpenLink,
            "takeScreenshot" => OpKind::TakeScreenshot,
            "volumeUp" => OpKind::VolumeUp,
            "volumeDown" => OpKind::VolumeDown,
            other if SKIPPED_COMMANDS.contains(&other) => OpKind::Skipped,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::LaunchApp => "launchApp",
            OpKind::TapOn => "tapOn",
            OpKind::DoubleTapOn => "doubleTapOn",
            OpKind::LongPressOn => "longPressOn",
            OpKind::AssertVisible => "assertVisible",
            OpKind::AssertNotVisible => "assertNotVisible",
            OpKind::InputText => "inputText",
            OpKind::EraseText => "eraseText",
            OpKind::PressKey => "pressKey",
            OpKind::Back => "back",
            OpKind::HideKeyboard => "hideKeyboard",
            OpKind::Scroll => "scroll",
            OpKind::Swipe => "swipe",
            OpKind::ScrollUntilVisible => "scrollUntilVisible",
            OpKind::Wait => "wait",
            OpKind::WaitForAnimationToEnd => "waitForAnimationToEnd",
            OpKind::ExtendedWaitUntil => "extendedWaitUntil",
            OpKind::StopApp => "stopApp",
            OpKind::ClearState => "clearState",
            OpKind::OpenLink => "openLink",
            OpKind::TakeScreenshot => "takeScreenshot",
            OpKind::VolumeUp => "volumeUp",
            OpKind::VolumeDown => "volumeDown",
            OpKind::Skipped => "skipped",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// An element query with optional index and wait timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    /// Literal text or `regexp:` pattern
    pub query: String,
    pub index: Option<usize>,
    pub timeout: Option<Duration>,
}

impl Locator {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            index: None,
            timeout: None,
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.query, i),
            None => f.write_str(&self.query),
        }
    }
}

/// Screen coordinates, absolute or as a percentage of the screen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointSpec {
    Pixels { x: i32, y: i32 },
    Percent { x: f64, y: f64 },
}

impl PointSpec {
    /// Parse `"540,1200"` or `"50%,80%"`
    pub fn parse(raw: &str) -> Option<PointSpec> {
        let (x, y) = raw.split_once(',')?;
        let (x, y) = (x.trim(), y.trim());
        match (x.strip_suffix('%'), y.strip_suffix('%')) {
            (Some(px), Some(py)) => Some(PointSpec::Percent {
                x: px.trim().parse().ok()?,
                y: py.trim().parse().ok()?,
            }),
            (None, None) => Some(PointSpec::Pixels {
                x: x.parse().ok()?,
                y: y.parse().ok()?,
            }),
            _ => None,
        }
    }

    /// Absolute pixel position on a screen of the given size
    pub fn to_pixels(self, (width, height): (i32, i32)) -> (i32, i32) {
        match self {
            PointSpec::Pixels { x, y } => (x, y),
            PointSpec::Percent { x, y } => (
                (f64::from(width) * x / 100.0).round() as i32,
                (f64::from(height) * y / 100.0).round() as i32,
            ),
        }
    }
}

impl fmt::Display for PointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointSpec::Pixels { x, y } => write!(f, "{},{}", x, y),
            PointSpec::Percent { x, y } => write!(f, "{}%,{}%", x, y),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Element(Locator),
    Point(PointSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TapParams {
    pub target: Target,
    /// Optional taps are skipped instead of failing
    pub optional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn parse(raw: &str) -> Option<Direction> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UP" => Some(Direction::Up),
            "DOWN" => Some(Direction::Down),
            "LEFT" => Some(Direction::Left),
            "RIGHT" => Some(Direction::Right),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Left => "LEFT",
            Direction::Right => "RIGHT",
        })
    }
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    LaunchApp { app_id: Option<String>, clear_state: bool },
    TapOn(TapParams),
    DoubleTapOn(TapParams),
    LongPressOn(TapParams),
    AssertVisible(Locator),
    AssertNotVisible(Locator),
    InputText(String),
    EraseText(u32),
    PressKey { name: String, code: u32 },
    Back,
    HideKeyboard,
    Scroll { direction: Direction, element: Option<Locator> },
    Swipe { direction: Direction, duration_ms: u64, element: Option<Locator> },
    ScrollUntilVisible { locator: Locator, direction: Direction },
    Wait(Duration),
    WaitForAnimationToEnd,
    ExtendedWaitUntil {
        visible: Option<Locator>,
        not_visible: Option<Locator>,
        timeout: Duration,
    },
    StopApp(Option<String>),
    ClearState(Option<String>),
    OpenLink(String),
    TakeScreenshot(String),
    VolumeUp,
    VolumeDown,
    /// Recognised command that is not executed
    Skipped(String),
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::LaunchApp { .. } => OpKind::LaunchApp,
            Operation::TapOn(_) => OpKind::TapOn,
            Operation::DoubleTapOn(_) => OpKind::DoubleTapOn,
            Operation::LongPressOn(_) => OpKind::LongPressOn,
            Operation::AssertVisible(_) => OpKind::AssertVisible,
            Operation::AssertNotVisible(_) => OpKind::AssertNotVisible,
            Operation::InputText(_) => OpKind::InputText,
            Operation::EraseText(_) => OpKind::EraseText,
            Operation::PressKey { .. } => OpKind::PressKey,
            Operation::Back => OpKind::Back,
            Operation::HideKeyboard => OpKind::HideKeyboard,
            Operation::Scroll { .. } => OpKind::Scroll,
            Operation::Swipe { .. } => OpKind::Swipe,
            Operation::ScrollUntilVisible { .. } => OpKind::ScrollUntilVisible,
            Operation::Wait(_) => OpKind::Wait,
            Operation::WaitForAnimationToEnd => OpKind::WaitForAnimationToEnd,
            Operation::ExtendedWaitUntil { .. } => OpKind::ExtendedWaitUntil,
            Operation::StopApp(_) => OpKind::StopApp,
            Operation::ClearState(_) => OpKind::ClearState,
            Operation::OpenLink(_) => OpKind::OpenLink,
            Operation::TakeScreenshot(_) => OpKind::TakeScreenshot,
            Operation::VolumeUp => OpKind::VolumeUp,
            Operation::VolumeDown => OpKind::VolumeDown,
            Operation::Skipped(_) => OpKind::Skipped,
        }
    }

    /// The element locator the step depends on, if any
    pub fn locator(&self) -> Option<&Locator> {
        match self {
            Operation::TapOn(p) | Operation::DoubleTapOn(p) | Operation::LongPressOn(p) => {
                match &p.target {
                    Target::Element(l) => Some(l),
                    Target::Point(_) => None,
                }
            }
            Operation::AssertVisible(l)
            | Operation::AssertNotVisible(l)
            | Operation::ScrollUntilVisible { locator: l, .. } => Some(l),
            Operation::Scroll { element, .. } | Operation::Swipe { element, .. } => element.as_ref(),
            Operation::ExtendedWaitUntil {
                visible,
                not_visible,
                ..
            } => visible.as_ref().or(not_visible.as_ref()),
            _ => None,
        }
    }

    fn locator_mut(&mut self) -> Option<&mut Locator> {
        match self {
            Operation::TapOn(p) | Operation::DoubleTapOn(p) | Operation::LongPressOn(p) => {
                match &mut p.target {
                    Target::Element(l) => Some(l),
                    Target::Point(_) => None,
                }
            }
            Operation::AssertVisible(l)
            | Operation::AssertNotVisible(l)
            | Operation::ScrollUntilVisible { locator: l, .. } => Some(l),
            Operation::Scroll { element, .. } | Operation::Swipe { element, .. } => element.as_mut(),
            Operation::ExtendedWaitUntil {
                visible,
                not_visible,
                ..
            } => visible.as_mut().or(not_visible.as_mut()),
            _ => None,
        }
    }

    /// Replace the step's locator query. Returns false for steps without one.
    pub fn apply_fix(&mut self, fix: &LocatorFix) -> bool {
        match self.locator_mut() {
            Some(locator) => {
                locator.query = fix.value().to_string();
                true
            }
            None => false,
        }
    }

    /// Decode one step from its command name and raw parameters
    pub fn from_yaml(name: &str, params: Option<&Value>) -> Result<Operation, FlowError> {
        let kind = OpKind::from_name(name).ok_or_else(|| FlowError::UnknownCommand {
            index: 0,
            name: name.to_string(),
        })?;
        let params = params.filter(|v| !v.is_null());
        let invalid = |message: &str| FlowError::InvalidParams {
            op: name.to_string(),
            message: message.to_string(),
        };

        let op = match kind {
            OpKind::LaunchApp => match params {
                None => Operation::LaunchApp {
                    app_id: None,
                    clear_state: false,
                },
                Some(Value::Mapping(map)) => Operation::LaunchApp {
                    app_id: get_str(map, "appId"),
                    clear_state: get_bool(map, "clearState"),
                },
                Some(other) => Operation::LaunchApp {
                    app_id: scalar_string(other),
                    clear_state: false,
                },
            },
            OpKind::TapOn | OpKind::DoubleTapOn | OpKind::LongPressOn => {
                let tap = tap_params(params).ok_or_else(|| invalid("expected a locator or point"))?;
                match kind {
                    OpKind::TapOn => Operation::TapOn(tap),
                    OpKind::DoubleTapOn => Operation::DoubleTapOn(tap),
                    _ => Operation::LongPressOn(tap),
                }
            }
            OpKind::AssertVisible => {
                Operation::AssertVisible(locator(params).ok_or_else(|| invalid("expected a locator"))?)
            }
            OpKind::AssertNotVisible => {
                Operation::AssertNotVisible(locator(params).ok_or_else(|| invalid("expected a locator"))?)
            }
            OpKind::InputText => {
                let text = match params {
                    Some(Value::Mapping(map)) => get_str(map, "text"),
                    Some(other) => scalar_string(other),
                    None => None,
                };
                Operation::InputText(text.ok_or_else(|| invalid("expected text"))?)
            }
            OpKind::EraseText => {
                let count = match params {
                    None => Some(u64::from(DEFAULT_ERASE_CHARS)),
                    Some(Value::Mapping(map)) => get_u64(map, "characters")
                        .or_else(|| get_u64(map, "charactersToErase"))
                        .or(Some(u64::from(DEFAULT_ERASE_CHARS))),
                    Some(other) => as_u64(other),
                };
                let count = count
                    .and_then(|c| u32::try_from(c).ok())
                    .ok_or_else(|| invalid("expected a character count"))?;
                Operation::EraseText(count)
            }
            OpKind::PressKey => {
                let raw = params
                    .and_then(scalar_string)
                    .ok_or_else(|| invalid("expected a key name or code"))?;
                let code = key_code(&raw).ok_or_else(|| invalid(&format!("unknown key '{}'", raw)))?;
                Operation::PressKey { name: raw, code }
            }
            OpKind::Back => Operation::Back,
            OpKind::HideKeyboard => Operation::HideKeyboard,
            OpKind::Scroll => {
                let (direction, element) = match params {
                    Some(Value::Mapping(map)) => (
                        direction_of(map, Direction::Down).ok_or_else(|| invalid("unknown direction"))?,
                        map.get("element").and_then(|v| locator(Some(v))),
                    ),
                    _ => (Direction::Down, None),
                };
                Operation::Scroll { direction, element }
            }
            OpKind::Swipe => match params {
                Some(Value::Mapping(map)) => Operation::Swipe {
                    direction: direction_of(map, Direction::Left)
                        .ok_or_else(|| invalid("unknown direction"))?,
                    duration_ms: get_u64(map, "duration").unwrap_or(DEFAULT_SWIPE_MS),
                    element: map.get("element").and_then(|v| locator(Some(v))),
                },
                Some(other) => Operation::Swipe {
                    direction: scalar_string(other)
                        .and_then(|d| Direction::parse(&d))
                        .ok_or_else(|| invalid("unknown direction"))?,
                    duration_ms: DEFAULT_SWIPE_MS,
                    element: None,
                },
                None => Operation::Swipe {
                    direction: Direction::Left,
                    duration_ms: DEFAULT_SWIPE_MS,
                    element: None,
                },
            },
            OpKind::ScrollUntilVisible => {
                let (target, direction) = match params {
                    Some(Value::Mapping(map)) => (
                        match map.get("element") {
                            Some(element) => locator(Some(element)),
                            None => locator(params),
                        },
                        direction_of(map, Direction::Down).ok_or_else(|| invalid("unknown direction"))?,
                    ),
                    other => (locator(other), Direction::Down),
                };
                Operation::ScrollUntilVisible {
                    locator: target.ok_or_else(|| invalid("expected an element"))?,
                    direction,
                }
            }
            OpKind::Wait => {
                let ms = match params {
                    Some(Value::Mapping(map)) => get_u64(map, "ms"),
                    Some(other) => as_u64(other),
                    None => None,
                };
                Operation::Wait(Duration::from_millis(ms.unwrap_or(DEFAULT_WAIT_MS)))
            }
            OpKind::WaitForAnimationToEnd => Operation::WaitForAnimationToEnd,
            OpKind::ExtendedWaitUntil => {
                let Some(Value::Mapping(map)) = params else {
                    return Err(invalid("expected a map with visible or notVisible"));
                };
                let pick = |a: &str, b: &str| map.get(a).or_else(|| map.get(b)).and_then(|v| locator(Some(v)));
                Operation::ExtendedWaitUntil {
                    visible: pick("visible", "assertVisible"),
                    not_visible: pick("notVisible", "assertNotVisible"),
                    timeout: Duration::from_millis(
                        get_u64(map, "timeout").unwrap_or(DEFAULT_EXTENDED_WAIT_MS),
                    ),
                }
            }
            OpKind::StopApp => Operation::StopApp(app_id_param(params)),
            OpKind::ClearState => Operation::ClearState(app_id_param(params)),
            OpKind::OpenLink => {
                let link = match params {
                    Some(Value::Mapping(map)) => get_str(map, "link"),
                    Some(other) => scalar_string(other),
                    None => None,
                };
                Operation::OpenLink(link.ok_or_else(|| invalid("expected a link"))?)
            }
            OpKind::TakeScreenshot => {
                let name = match params {
                    Some(Value::Mapping(map)) => get_str(map, "path"),
                    Some(other) => scalar_string(other),
                    None => None,
                };
                Operation::TakeScreenshot(name.unwrap_or_else(|| "screenshot".to_string()))
            }
            OpKind::VolumeUp => Operation::VolumeUp,
            OpKind::VolumeDown => Operation::VolumeDown,
            OpKind::Skipped => Operation::Skipped(name.to_string()),
        };
        Ok(op)
    }
}

/// Map a `pressKey` argument to an Android key code
pub fn key_code(raw: &str) -> Option<u32> {
    if let Ok(code) = raw.trim().parse::<u32>() {
        return Some(code);
    }
    let normalized: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect::<String>()
        .to_ascii_lowercase();
    let code = match normalized.as_str() {
        "enter" => keycode::ENTER,
        "back" => keycode::BACK,
        "home" => keycode::HOME,
        "backspace" | "delete" => keycode::DEL,
        "tab" => keycode::TAB,
        "escape" => keycode::ESCAPE,
        "volumeup" => keycode::VOLUME_UP,
        "volumedown" => keycode::VOLUME_DOWN,
        "power" => keycode::POWER,
        "search" => keycode::SEARCH,
        "menu" => keycode::MENU,
        _ => return None,
    };
    Some(code)
}

// ============================================================================
// Parameter helpers
// ============================================================================

fn tap_params(params: Option<&Value>) -> Option<TapParams> {
    if let Some(Value::Mapping(map)) = params {
        let optional = get_bool(map, "optional");
        if let Some(point) = get_str(map, "point") {
            return Some(TapParams {
                target: Target::Point(PointSpec::parse(&point)?),
                optional,
            });
        }
        return Some(TapParams {
            target: Target::Element(locator(params)?),
            optional,
        });
    }
    Some(TapParams {
        target: Target::Element(locator(params)?),
        optional: false,
    })
}

/// Resolve a locator from a scalar or a map, following key priority.
/// Ids containing regex metacharacters become `regexp:` queries.
pub fn locator(params: Option<&Value>) -> Option<Locator> {
    let map = match params? {
        Value::Mapping(map) => map,
        other => return scalar_string(other).map(Locator::new),
    };
    if map.contains_key("point") {
        return None;
    }

    let by_key = LOCATOR_KEYS.iter().find_map(|key| {
        let value = map.get(*key).and_then(scalar_string)?;
        let is_id = matches!(*key, "id" | "resourceId");
        if is_id && !value.starts_with(REGEX_PREFIX) && looks_like_regex(&value) {
            Some(format!("{}{}", REGEX_PREFIX, value))
        } else {
            Some(value)
        }
    });
    let query = by_key.or_else(|| {
        map.iter()
            .filter(|(k, _)| k.as_str().is_some_and(|k| !META_KEYS.contains(&k)))
            .find_map(|(_, v)| scalar_string(v))
    })?;

    Some(Locator {
        query,
        index: get_u64(map, "index").and_then(|i| usize::try_from(i).ok()),
        timeout: get_u64(map, "timeout").map(Duration::from_millis),
    })
}

fn looks_like_regex(value: &str) -> bool {
    [".*", "+", "^", "$", "|"].iter().any(|m| value.contains(m))
}

fn direction_of(map: &Mapping, default: Direction) -> Option<Direction> {
    match get_str(map, "direction") {
        Some(raw) => Direction::parse(&raw),
        None => Some(default),
    }
}

fn app_id_param(params: Option<&Value>) -> Option<String> {
    match params? {
        Value::Mapping(map) => get_str(map, "appId"),
        other => scalar_string(other),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn get_str(map: &Mapping, key: &str) -> Option<String> {
    map.get(key).and_then(scalar_string)
}

fn get_u64(map: &Mapping, key: &str) -> Option<u64> {
    map.get(key).and_then(as_u64)
}

fn get_bool(map: &Mapping, key: &str) -> bool {
    match map.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn op(name: &str, yaml: &str) -> Result<Operation, FlowError> {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        Operation::from_yaml(name, Some(&value))
    }

    #[test]
    fn test_locator_key_priority() {
        let tap = op("tapOn", "{text: Login, id: login_btn}").unwrap();
        assert_eq!(tap.locator().unwrap().query, "login_btn");

        let by_desc = op("assertVisible", "{contentDescription: Profile, index: 2, timeout: 1500}").unwrap();
        let locator = by_desc.locator().unwrap();
        assert_eq!(locator.query, "Profile");
        assert_eq!(locator.index, Some(2));
        assert_eq!(locator.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_regex_promotion_only_for_ids() {
        let by_id = op("tapOn", "{id: 'com.app:id/item_.*'}").unwrap();
        assert_eq!(by_id.locator().unwrap().query, "regexp:com.app:id/item_.*");

        let by_text = op("tapOn", "{text: 'Price $5'}").unwrap();
        assert_eq!(by_text.locator().unwrap().query, "Price $5");
    }

    #[test]
    fn test_point_targets() {
        let tap = op("tapOn", "{point: '50%,80%'}").unwrap();
        let Operation::TapOn(TapParams {
            target: Target::Point(point),
            ..
        }) = tap
        else {
            panic!("expected point tap");
        };
        assert_eq!(point.to_pixels((1080, 2400)), (540, 1920));
        assert_eq!(PointSpec::parse("100, 200"), Some(PointSpec::Pixels { x: 100, y: 200 }));
        assert_eq!(PointSpec::parse("50%,200"), None);
    }

    #[test]
    fn test_optional_tap() {
        let tap = op("tapOn", "{text: Skip, optional: true}").unwrap();
        assert!(matches!(tap, Operation::TapOn(TapParams { optional: true, .. })));
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Operation::from_yaml("eraseText", None).unwrap(), Operation::EraseText(50));
        assert_eq!(
            Operation::from_yaml("wait", None).unwrap(),
            Operation::Wait(Duration::from_millis(1000))
        );
        assert_eq!(
            Operation::from_yaml("swipe", None).unwrap(),
            Operation::Swipe {
                direction: Direction::Left,
                duration_ms: 500,
                element: None
            }
        );
        assert_eq!(
            op("scroll", "{direction: up}").unwrap(),
            Operation::Scroll {
                direction: Direction::Up,
                element: None
            }
        );
    }

    #[test]
    fn test_press_key_names() {
        assert_eq!(key_code("Enter"), Some(66));
        assert_eq!(key_code("Volume Up"), Some(24));
        assert_eq!(key_code("backspace"), Some(67));
        assert_eq!(key_code("82"), Some(82));
        assert_eq!(key_code("Hyper"), None);
        assert!(matches!(op("pressKey", "Hyper"), Err(FlowError::InvalidParams { .. })));
    }

    #[test]
    fn test_scroll_until_visible_shapes() {
        let nested = op("scrollUntilVisible", "{element: {text: Footer}, direction: UP}").unwrap();
        assert_eq!(
            nested,
            Operation::ScrollUntilVisible {
                locator: Locator::new("Footer"),
                direction: Direction::Up
            }
        );
        let flat = op("scrollUntilVisible", "Footer").unwrap();
        assert_eq!(flat.locator().unwrap().query, "Footer");
    }

    #[test]
    fn test_extended_wait_until() {
        let wait = op("extendedWaitUntil", "{visible: {text: Done}, timeout: 8000}").unwrap();
        assert_eq!(
            wait,
            Operation::ExtendedWaitUntil {
                visible: Some(Locator::new("Done")),
                not_visible: None,
                timeout: Duration::from_millis(8000)
            }
        );
    }

    #[test]
    fn test_apply_fix() {
        let mut tap = op("tapOn", "Save").unwrap();
        assert!(tap.apply_fix(&LocatorFix::Text("Save changes".into())));
        assert_eq!(tap.locator().unwrap().query, "Save changes");

        let mut back = Operation::Back;
        assert!(!back.apply_fix(&LocatorFix::Text("x".into())));
    }

    #[test]
    fn test_kill_app_alias_and_skipped() {
        assert_eq!(OpKind::from_name("killApp"), Some(OpKind::StopApp));
        assert_eq!(
            Operation::from_yaml("runFlow", None).unwrap(),
            Operation::Skipped("runFlow".into())
        );
        assert_eq!(OpKind::from_name("teleport"), None);
    }
}
