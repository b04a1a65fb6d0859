//! How register values look on the Homie side.
use std::collections::BTreeMap;

use homie5::device_description::{
    HomieNodeDescription, HomiePropertyDescription, HomiePropertyFormat,
    PropertyDescriptionBuilder,
};
use homie5::{HomieDataType, HomieID};

use crate::fields::Kind;
use crate::registry::DeviceSpec;
use crate::value::{DeviceValue, LEVEL_STEP, SELECTOR_ACTIVE, SetValue, parse_numeric};

pub(crate) static VALUE: HomieID = HomieID::new_const("value");
pub(crate) static TIMED_OUT: HomieID = HomieID::new_const("timed-out");
pub(crate) static LAST_SEEN: HomieID = HomieID::new_const("last-seen");

fn datatype(kind: Kind) -> HomieDataType {
    match kind {
        Kind::SwitchOnOff | Kind::SwitchYesNo => HomieDataType::Boolean,
        Kind::Selector => HomieDataType::Enum,
        Kind::Number
        | Kind::Custom
        | Kind::TemperatureSetpoint
        | Kind::TemperatureReadOnly
        | Kind::Pressure => HomieDataType::Float,
        Kind::Text => HomieDataType::String,
    }
}

fn value_description(spec: &DeviceSpec) -> HomiePropertyDescription {
    let mut builder = PropertyDescriptionBuilder::new(datatype(spec.kind)).retained(true);
    if !spec.unit.is_empty() {
        builder = builder.unit(spec.unit.as_str());
    }
    if spec.kind == Kind::Selector && !spec.levels.is_empty() {
        builder = builder.format(HomiePropertyFormat::Enum(spec.levels.clone()));
    }
    let mut description = builder.build();
    description.settable = spec.settable;
    description
}

/// The node a register is published as.
pub(crate) fn node_description(spec: &DeviceSpec) -> HomieNodeDescription {
    let mut properties = BTreeMap::new();
    properties.insert(VALUE.clone(), value_description(spec));
    properties.insert(
        TIMED_OUT.clone(),
        PropertyDescriptionBuilder::new(HomieDataType::Boolean).retained(true).build(),
    );
    properties.insert(
        LAST_SEEN.clone(),
        PropertyDescriptionBuilder::new(HomieDataType::Datetime).retained(true).build(),
    );
    HomieNodeDescription { name: Some(spec.name.clone()), r#type: None, properties }
}

/// A node ID derived from a register key: `f47:Hc1DayTemp:0` becomes `f47-hc1daytemp-0`.
pub(crate) fn node_id_for(key: &str) -> String {
    let mut id = String::with_capacity(key.len());
    for c in key.chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            id.push(c);
        } else if !id.is_empty() && !id.ends_with('-') {
            id.push('-');
        }
    }
    while id.ends_with('-') {
        id.pop();
    }
    id
}

/// The payload of the `value` property.
pub(crate) fn payload(spec: &DeviceSpec, value: &DeviceValue) -> String {
    match spec.kind {
        Kind::SwitchOnOff | Kind::SwitchYesNo => (value.numeric != 0).to_string(),
        // Only settable selectors report ordinals, and only for values that matched an option.
        Kind::Selector if spec.settable && value.numeric == SELECTOR_ACTIVE => {
            let level = value
                .text
                .parse::<i32>()
                .ok()
                .filter(|ordinal| ordinal % LEVEL_STEP == 0)
                .and_then(|ordinal| usize::try_from(ordinal / LEVEL_STEP - 1).ok())
                .and_then(|index| spec.levels.get(index));
            match level {
                Some(level) => level.clone(),
                None => value.text.clone(),
            }
        }
        Kind::Selector => value.text.clone(),
        Kind::Number
        | Kind::Custom
        | Kind::TemperatureSetpoint
        | Kind::TemperatureReadOnly
        | Kind::Pressure => match value.text.trim().parse::<f64>() {
            Ok(_) => value.text.trim().to_string(),
            Err(_) => value.numeric.to_string(),
        },
        Kind::Text => value.text.clone(),
    }
}

/// Decode a `…/value/set` payload. `None` if the payload makes no sense for this kind.
pub(crate) fn decode_set(spec: &DeviceSpec, payload: &str) -> Option<SetValue> {
    let payload = payload.trim();
    match spec.kind {
        Kind::SwitchOnOff | Kind::SwitchYesNo => match payload.to_lowercase().as_str() {
            "true" | "on" | "yes" => Some(SetValue::new("on", 1, "")),
            "false" | "off" | "no" => Some(SetValue::new("off", 0, "")),
            "toggle" => Some(SetValue::new("toggle", 0, "")),
            _ => None,
        },
        Kind::Selector => {
            let index = spec.levels.iter().position(|l| l == payload)?;
            let ordinal = (i32::try_from(index).ok()? + 1) * LEVEL_STEP;
            Some(SetValue::new("set level", ordinal, payload))
        }
        _ => Some(SetValue::new("set", parse_numeric(payload), payload)),
    }
}
