//! The message schema ebusd publishes on its JSON endpoint (`/data?def&write`).
//!
//! The document is keyed by circuit name and looks roughly like this:
//!
//! ```json
//! {
//!   "global": { "version": "…" },
//!   "f47": {
//!     "messages": {
//!       "OutsideTemp": {
//!         "name": "OutsideTemp",
//!         "fielddefs": [
//!           { "name": "temp", "type": "D2C", "unit": "°C", "comment": "Temperature" },
//!           { "name": "sensor", "type": "UCH", "unit": "", "comment": "", "values": {"0": "ok"} }
//!         ]
//!       },
//!       "Hc1DayTemp-w": { "name": "Hc1DayTemp", "write": true, "fielddefs": [ … ] }
//!     }
//!   }
//! }
//! ```
//!
//! Lookups are case-insensitive. Rather than carrying that around, all keys are normalized once
//! with [`canonical_key`] when the document is parsed.
use std::collections::BTreeMap;

use tracing::{debug, trace};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("discovery document is not valid JSON")]
    Json(#[source] serde_json::Error),
    #[error("discovery document is not a JSON object")]
    NotAnObject,
}

/// Normalize a circuit, message or field key: surrounding whitespace and any bracketed suffix
/// (e.g. `Name [comment]` or `name[2]`) are removed and the rest is lower-cased.
pub fn canonical_key(key: &str) -> String {
    let mut key = key.trim();
    if key.ends_with(']') {
        if let Some(open) = key.rfind('[') {
            key = key[..open].trim_end();
        }
    }
    key.to_lowercase()
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct FieldDef {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub type_code: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub comment: String,
    /// Value enumeration, `code -> name`.
    #[serde(default)]
    pub values: Option<BTreeMap<String, serde_json::Value>>,
}

impl FieldDef {
    pub fn class(&self) -> crate::fields::FieldClass {
        crate::fields::classify(&self.unit, &self.name, &self.type_code)
    }

    /// The value enumeration as `(code, name)` pairs, skipping anything that isn't a string.
    pub fn value_names(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .flatten()
            .filter_map(|(code, name)| Some((code.as_str(), name.as_str()?)))
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
struct RawMessage {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    write: bool,
    #[serde(default)]
    fielddefs: Option<Vec<FieldDef>>,
}

#[derive(Debug, Clone)]
pub struct Message {
    /// The name to address this message with on the command connection.
    pub name: String,
    pub write: bool,
    pub fielddefs: Option<Vec<FieldDef>>,
}

#[derive(Debug, Clone)]
pub struct Circuit {
    /// The name to address this circuit with on the command connection.
    pub name: String,
    /// Messages, keyed by their canonical key. Write variants keep their `-w` suffix.
    pub messages: BTreeMap<String, Message>,
}

impl Circuit {
    /// The writable variant of a message, if ebusd reports one.
    pub fn write_variant(&self, message_key: &str) -> Option<&Message> {
        self.messages.get(&format!("{message_key}-w")).filter(|m| m.write)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// Circuits, keyed by their canonical key.
    pub circuits: BTreeMap<String, Circuit>,
}

impl Schema {
    pub fn parse(data: &str) -> Result<Schema, Error> {
        let document = serde_json::from_str::<serde_json::Value>(data).map_err(Error::Json)?;
        Self::from_json(document)
    }

    pub fn from_json(document: serde_json::Value) -> Result<Schema, Error> {
        let serde_json::Value::Object(document) = document else {
            return Err(Error::NotAnObject);
        };
        let mut circuits = BTreeMap::new();
        for (circuit_name, circuit) in document {
            // Entries such as `global` aren't circuits and have no messages.
            let Some(serde_json::Value::Object(messages)) = circuit.get("messages") else {
                trace!(message = "skipping non-circuit entry", circuit_name);
                continue;
            };
            let mut parsed = BTreeMap::new();
            for (message_key, message) in messages {
                let raw = match serde_json::from_value::<RawMessage>(message.clone()) {
                    Ok(raw) => raw,
                    Err(e) => {
                        debug!(
                            message = "skipping malformed message definition",
                            circuit_name,
                            message_key,
                            error = (&e as &dyn std::error::Error)
                        );
                        continue;
                    }
                };
                let name = raw
                    .name
                    .unwrap_or_else(|| message_key.strip_suffix("-w").unwrap_or(message_key).into());
                let message = Message { name, write: raw.write, fielddefs: raw.fielddefs };
                parsed.insert(canonical_key(message_key), message);
            }
            let circuit = Circuit { name: circuit_name.clone(), messages: parsed };
            circuits.insert(canonical_key(&circuit_name), circuit);
        }
        Ok(Schema { circuits })
    }

    pub fn message(&self, circuit: &str, message: &str) -> Option<(&Circuit, &Message)> {
        let circuit = self.circuits.get(circuit)?;
        Some((circuit, circuit.messages.get(message)?))
    }
}
