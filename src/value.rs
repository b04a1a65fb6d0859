//! Translation between raw ebusd field strings and the `(numeric, text)` pairs devices carry.
use std::collections::BTreeMap;

use crate::fields::Kind;

/// Numeric value reported for a selector whose raw value matched one of its options.
pub const SELECTOR_ACTIVE: i32 = 2;

/// Ordinal distance between two consecutive selector levels.
pub const LEVEL_STEP: i32 = 10;

/// A decoded value as devices carry it.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DeviceValue {
    pub numeric: i32,
    pub text: String,
}

impl DeviceValue {
    pub fn new(numeric: i32, text: impl Into<String>) -> Self {
        Self { numeric, text: text.into() }
    }
}

/// A value change requested from the automation side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetValue {
    /// The command word, e.g. `on`, `toggle` or `set level`. Matched case-insensitively.
    pub command: String,
    pub numeric: i32,
    pub text: String,
}

impl SetValue {
    pub fn new(command: impl Into<String>, numeric: i32, text: impl Into<String>) -> Self {
        Self { command: command.into(), numeric, text: text.into() }
    }
}

/// Selector options of a register.
///
/// Both maps are empty for anything that isn't a selector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OptionTable {
    /// Raw bus value to the text reported for it.
    pub forward: BTreeMap<String, String>,
    /// Level ordinal to the raw bus value.
    pub reverse: BTreeMap<i32, String>,
    /// Level names, in ordinal order.
    pub levels: Vec<String>,
}

impl OptionTable {
    /// Build the options out of a schema value enumeration (`code -> name`).
    ///
    /// Options are ordered by their code and assigned ordinals `10, 20, 30, …` in that order.
    /// Writable selectors report the ordinal; read-only ones report the raw value itself.
    pub fn selector<'a>(
        values: impl IntoIterator<Item = (&'a str, &'a str)>,
        writable: bool,
    ) -> OptionTable {
        let mut sorted = values.into_iter().collect::<Vec<_>>();
        sorted.sort_by(|(a, _), (b, _)| {
            match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                (Ok(_), Err(_)) => std::cmp::Ordering::Less,
                (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
                (Err(_), Err(_)) => a.cmp(b),
            }
        });
        let mut table = OptionTable::default();
        for (ordinal, (_, name)) in (1..).map(|n: i32| n * LEVEL_STEP).zip(sorted) {
            let reported = if writable { ordinal.to_string() } else { name.to_string() };
            table.forward.insert(name.to_string(), reported);
            table.reverse.insert(ordinal, name.to_string());
            table.levels.push(name.to_string());
        }
        table
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.reverse.is_empty()
    }

    /// The ordinal of a level name.
    pub fn ordinal_of(&self, level: &str) -> Option<i32> {
        self.reverse.iter().find(|(_, v)| v.as_str() == level).map(|(k, _)| *k)
    }
}

/// Convert a requested change into the value string ebusd expects.
pub fn to_bus(kind: Kind, options: &OptionTable, set: &SetValue, previous: i32) -> String {
    if !options.reverse.is_empty() {
        return match options.reverse.get(&set.numeric) {
            Some(raw) => raw.clone(),
            None => set.numeric.to_string(),
        };
    }
    let (truthy, falsy) = kind.bus_booleans();
    match set.command.to_lowercase().as_str() {
        "on" | "yes" => truthy.to_string(),
        "off" | "no" => falsy.to_string(),
        "toggle" if previous != 0 => falsy.to_string(),
        "toggle" => truthy.to_string(),
        _ if kind.is_switch() && set.numeric != 0 => truthy.to_string(),
        _ if kind.is_switch() => falsy.to_string(),
        _ if !set.text.is_empty() => set.text.clone(),
        _ => set.numeric.to_string(),
    }
}

/// Convert a raw field string read from ebusd into a device value.
pub fn from_bus(options: &OptionTable, raw: &str) -> DeviceValue {
    if !options.forward.is_empty() {
        return match options.forward.get(raw) {
            Some(reported) => DeviceValue::new(SELECTOR_ACTIVE, reported.clone()),
            None => DeviceValue::new(parse_numeric(raw), raw),
        };
    }
    match raw.to_lowercase().as_str() {
        "on" | "yes" => DeviceValue::new(1, "100"),
        "off" | "no" => DeviceValue::new(0, "0"),
        _ => DeviceValue::new(parse_numeric(raw), raw),
    }
}

/// Parse the numeric part of a raw value, truncating decimals.
///
/// Anything that doesn't parse is 0, and so is anything outside of the signed 32-bit range
/// (including `i32::MAX` itself, which some hosts treat as a marker value.)
pub fn parse_numeric(raw: &str) -> i32 {
    let raw = raw.trim();
    let wide = match raw.parse::<i64>() {
        Ok(v) => v,
        Err(_) => match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => v.trunc() as i64,
            _ => return 0,
        },
    };
    if wide >= i64::from(i32::MAX) || wide < i64::from(i32::MIN) {
        return 0;
    }
    wide as i32
}
