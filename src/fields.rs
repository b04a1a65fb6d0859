//! Classification of ebusd field definitions into the kinds of values we know how to expose.

/// The type code ebusd uses for fields that are present on the wire but never reported.
pub const IGNORE_TYPE: &str = "IGN";
/// Field name ebusd gives to boolean fields reported as `on`/`off`.
pub const ON_OFF_NAME: &str = "onoff";
/// Field name ebusd gives to boolean fields reported as `yes`/`no`.
pub const YES_NO_NAME: &str = "yesno";

const TEMPERATURE_UNITS: &[&str] = &["°C", "°F"];
const PRESSURE_UNITS: &[&str] = &["bar", "mbar"];
const NUMERIC_UNITS: &[&str] = &["min", "h", "s"];

// Base data types ebusd decodes into a plain number.
const NUMERIC_TYPES: &[&str] = &[
    "BCD", "BCD:2", "BCD:3", "BCD:4", "HCD", "HCD:2", "HCD:3", "HCD:4", "PIN", "UCH", "SCH",
    "D1B", "D1C", "D2B", "D2C", "FLT", "FLR", "EXP", "EXR", "UIN", "UIR", "SIN", "SIR", "U3N",
    "U3R", "S3N", "S3R", "ULG", "ULR", "SLG", "SLR", "BI0", "BI1", "BI2", "BI3", "BI4", "BI5",
    "BI6", "BI7", "TEM_P", "NIB",
];

/// What a single field definition looks like, as far as value handling is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum FieldClass {
    /// Not reported by ebusd at all; excluded from field counts.
    Ignore,
    Temperature,
    Pressure,
    Number,
    /// Numeric with a unit we don't have a dedicated kind for.
    Custom,
    SwitchOnOff,
    SwitchYesNo,
    Text,
}

/// Classify a field definition. First matching rule wins.
pub fn classify(unit: &str, name: &str, type_code: &str) -> FieldClass {
    if type_code == IGNORE_TYPE {
        FieldClass::Ignore
    } else if TEMPERATURE_UNITS.contains(&unit) {
        FieldClass::Temperature
    } else if PRESSURE_UNITS.contains(&unit) {
        FieldClass::Pressure
    } else if NUMERIC_UNITS.contains(&unit) {
        FieldClass::Number
    } else if !unit.is_empty() {
        FieldClass::Custom
    } else if name == ON_OFF_NAME {
        FieldClass::SwitchOnOff
    } else if name == YES_NO_NAME {
        FieldClass::SwitchYesNo
    } else if NUMERIC_TYPES.contains(&type_code) {
        FieldClass::Number
    } else {
        FieldClass::Text
    }
}

/// The resolved kind of a register, which decides how its device is presented and how values are
/// translated in both directions.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    SwitchOnOff,
    SwitchYesNo,
    Selector,
    Number,
    Custom,
    TemperatureSetpoint,
    TemperatureReadOnly,
    Pressure,
    Text,
}

impl Kind {
    /// Resolve the kind of a field from its class and schema details.
    ///
    /// Returns `None` for ignored fields. Switches take precedence over value enumerations, which
    /// in turn take precedence over everything else.
    pub fn resolve(class: FieldClass, has_values: bool, writable: bool) -> Option<Kind> {
        Some(match class {
            FieldClass::Ignore => return None,
            FieldClass::SwitchOnOff => Kind::SwitchOnOff,
            FieldClass::SwitchYesNo => Kind::SwitchYesNo,
            _ if has_values => Kind::Selector,
            FieldClass::Temperature if writable => Kind::TemperatureSetpoint,
            FieldClass::Temperature => Kind::TemperatureReadOnly,
            FieldClass::Pressure => Kind::Pressure,
            FieldClass::Number => Kind::Number,
            FieldClass::Custom => Kind::Custom,
            FieldClass::Text => Kind::Text,
        })
    }

    pub fn is_switch(self) -> bool {
        matches!(self, Kind::SwitchOnOff | Kind::SwitchYesNo)
    }

    /// Sensors that should visibly tick on every read, even if the value hasn't changed.
    pub fn always_refresh(self) -> bool {
        matches!(self, Kind::TemperatureReadOnly | Kind::Pressure)
    }

    /// The `(true, false)` words ebusd uses for this kind.
    pub fn bus_booleans(self) -> (&'static str, &'static str) {
        match self {
            Kind::SwitchYesNo => ("yes", "no"),
            _ => ("on", "off"),
        }
    }
}
