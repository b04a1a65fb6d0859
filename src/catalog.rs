//! The register catalog and the builder that fills it out of ebusd's discovery document.
//!
//! Every selected register ends up in one of two slots: resolved, with the device it is bridged
//! into, or failed, with the reason it can't ever be bridged. Registers that ebusd simply doesn't
//! know about yet have no slot at all and make the catalog incomplete, so that discovery is
//! retried later.
use std::collections::BTreeMap;
use std::fmt;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::fields::{FieldClass, Kind};
use crate::registry::{DeviceId, DeviceRegistry, DeviceSpec, RegistryError};
use crate::schema::{Circuit, FieldDef, Message, Schema, canonical_key};
use crate::selection::{FieldRef, Literal, RegisterPath, Selection};
use crate::value::OptionTable;

/// A message on a circuit, by canonical keys.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageKey {
    pub circuit: String,
    pub message: String,
}

impl MessageKey {
    pub fn new(circuit: &str, message: &str) -> Self {
        Self { circuit: canonical_key(circuit), message: canonical_key(message) }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.circuit, self.message)
    }
}

/// One field of one message on one circuit.
///
/// Displays as the `circuit:message:index` key that identifies the register's device.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register {
    pub message: MessageKey,
    pub field_index: usize,
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.message, self.field_index)
    }
}

/// The last full row of field values read for a message, shared by all of its registers.
#[derive(Clone, Debug)]
pub struct MessageRow {
    /// Circuit name as the command connection expects it.
    pub circuit_name: String,
    /// Message name as the command connection expects it.
    pub message_name: String,
    pub field_count: usize,
    pub values: Option<Vec<String>>,
    pub updated: Option<Instant>,
}

impl MessageRow {
    pub fn store(&mut self, values: Vec<String>, now: Instant) {
        self.values = Some(values);
        self.updated = Some(now);
    }

    /// The row, if it has been read no earlier than `max_age` before `now`.
    pub fn fresh(&self, now: Instant, max_age: std::time::Duration) -> Option<&[String]> {
        let updated = self.updated?;
        if now.saturating_duration_since(updated) > max_age {
            return None;
        }
        self.values.as_deref()
    }
}

#[derive(Clone, Debug)]
pub struct RegisterEntry {
    pub register: Register,
    pub device: DeviceId,
    pub spec: DeviceSpec,
    pub options: OptionTable,
    pub field_count: usize,
    /// Push the next value even if it is unchanged, reconfiguring the device.
    pub force_refresh: bool,
    /// Push every value, changed or not.
    pub always_refresh: bool,
    /// When a value for this register was last read.
    pub last_seen: Option<Instant>,
}

impl RegisterEntry {
    pub fn kind(&self) -> Kind {
        self.spec.kind
    }

    pub fn settable(&self) -> bool {
        self.spec.settable
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("`{0}` is not of the form `circuit:message` or `circuit:message:field`")]
    Malformed(String),
    #[error("message `{0}` has no field definitions")]
    NoFieldDefinitions(MessageKey),
    #[error("message `{0}` has only {1} fields, field {2} does not exist")]
    FieldOutOfRange(MessageKey, usize, usize),
    #[error("message `{0}` has no field named `{1}`")]
    UnknownField(MessageKey, String),
    #[error("device for `{1}` cannot be created")]
    TooManyDevices(#[source] RegistryError, String),
}

#[derive(Clone, Debug)]
pub enum Slot {
    Resolved(RegisterEntry),
    Failed(ResolveError),
}

/// What a discovery pass changed.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Registers that were resolved during this pass, in resolution order.
    pub resolved: Vec<Register>,
    /// Whether every selected register is now either resolved or known to be unresolvable.
    pub complete: bool,
}

enum AdmitError {
    /// Try again on the next discovery pass.
    Transient,
    Permanent(ResolveError),
}

/// A message as far as the catalog is concerned: ignored fields dropped, the rest renumbered.
struct MessageLayout<'a> {
    key: MessageKey,
    circuit_name: &'a str,
    message_name: &'a str,
    fields: Vec<&'a FieldDef>,
    writable: bool,
}

impl<'a> MessageLayout<'a> {
    fn new(
        circuit: &'a Circuit,
        key: MessageKey,
        message: &'a Message,
        read_only: bool,
    ) -> Result<Self, ResolveError> {
        let write_variant = if read_only { None } else { circuit.write_variant(&key.message) };
        let source = write_variant.unwrap_or(message);
        let fields = source
            .fielddefs
            .iter()
            .flatten()
            .filter(|f| f.class() != FieldClass::Ignore)
            .collect::<Vec<_>>();
        if fields.is_empty() {
            return Err(ResolveError::NoFieldDefinitions(key));
        }
        Ok(Self {
            key,
            circuit_name: &circuit.name,
            message_name: &message.name,
            fields,
            writable: write_variant.is_some(),
        })
    }

    fn index_of(&self, field: &FieldRef) -> Result<usize, ResolveError> {
        match field {
            FieldRef::Index(index) if *index < self.fields.len() => Ok(*index),
            FieldRef::Index(index) => {
                Err(ResolveError::FieldOutOfRange(self.key.clone(), self.fields.len(), *index))
            }
            FieldRef::Name(name) => self
                .fields
                .iter()
                .position(|f| canonical_key(&f.name) == *name)
                .ok_or_else(|| ResolveError::UnknownField(self.key.clone(), name.clone())),
        }
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    slots: BTreeMap<String, Slot>,
    rows: BTreeMap<MessageKey, MessageRow>,
    complete: bool,
}

impl Catalog {
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn entry(&self, key: &str) -> Option<&RegisterEntry> {
        match self.slots.get(key)? {
            Slot::Resolved(entry) => Some(entry),
            Slot::Failed(_) => None,
        }
    }

    pub fn entry_mut(&mut self, key: &str) -> Option<&mut RegisterEntry> {
        match self.slots.get_mut(key)? {
            Slot::Resolved(entry) => Some(entry),
            Slot::Failed(_) => None,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegisterEntry> {
        self.slots.values().filter_map(|slot| match slot {
            Slot::Resolved(entry) => Some(entry),
            Slot::Failed(_) => None,
        })
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut RegisterEntry> {
        self.slots.values_mut().filter_map(|slot| match slot {
            Slot::Resolved(entry) => Some(entry),
            Slot::Failed(_) => None,
        })
    }

    /// Terms and registers that will never be resolved, with the reason why.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &ResolveError)> {
        self.slots.iter().filter_map(|(key, slot)| match slot {
            Slot::Resolved(_) => None,
            Slot::Failed(e) => Some((key.as_str(), e)),
        })
    }

    pub fn row(&self, key: &MessageKey) -> Option<&MessageRow> {
        self.rows.get(key)
    }

    pub fn row_mut(&mut self, key: &MessageKey) -> Option<&mut MessageRow> {
        self.rows.get_mut(key)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&MessageKey, &MessageRow)> {
        self.rows.iter()
    }

    /// Resolve everything `selection` asks for against a discovery document.
    ///
    /// Registers already in the catalog, resolved or failed, are left alone. Devices are looked up
    /// in or created through `registry`.
    pub fn apply_discovery(
        &mut self,
        schema: &Schema,
        selection: &Selection,
        read_only: bool,
        registry: &mut dyn DeviceRegistry,
    ) -> Discovery {
        let mut discovery = Discovery { resolved: Vec::new(), complete: true };
        for literal in &selection.literals {
            let path = match literal {
                Literal::Path(path) => path,
                Literal::Malformed(term) => {
                    self.fail(term, ResolveError::Malformed(term.clone()));
                    continue;
                }
            };
            let term = path.to_string();
            if matches!(self.slots.get(&term), Some(Slot::Failed(_))) {
                continue;
            }
            match self.resolve_literal(schema, path, read_only, registry) {
                Ok(Some(register)) => discovery.resolved.push(register),
                Ok(None) => {}
                Err(AdmitError::Transient) => discovery.complete = false,
                Err(AdmitError::Permanent(e)) => self.fail(&term, e),
            }
        }
        if selection.has_patterns() {
            self.resolve_patterns(schema, selection, read_only, registry, &mut discovery);
        }
        self.complete = discovery.complete;
        discovery
    }

    fn resolve_literal(
        &mut self,
        schema: &Schema,
        path: &RegisterPath,
        read_only: bool,
        registry: &mut dyn DeviceRegistry,
    ) -> Result<Option<Register>, AdmitError> {
        let Some((circuit, message)) = schema.message(&path.circuit, &path.message) else {
            info!(message = "register not known to ebusd yet, will retry", register = %path);
            return Err(AdmitError::Transient);
        };
        let key = MessageKey { circuit: path.circuit.clone(), message: path.message.clone() };
        let layout =
            MessageLayout::new(circuit, key, message, read_only).map_err(AdmitError::Permanent)?;
        let index = layout.index_of(&path.field).map_err(AdmitError::Permanent)?;
        self.admit(&layout, index, registry)
    }

    fn resolve_patterns(
        &mut self,
        schema: &Schema,
        selection: &Selection,
        read_only: bool,
        registry: &mut dyn DeviceRegistry,
        discovery: &mut Discovery,
    ) {
        for (circuit_key, circuit) in &schema.circuits {
            for (message_key, message) in &circuit.messages {
                if message.write {
                    continue;
                }
                let key = MessageKey { circuit: circuit_key.clone(), message: message_key.clone() };
                let Ok(layout) = MessageLayout::new(circuit, key, message, read_only) else {
                    continue;
                };
                for (index, field) in layout.fields.iter().enumerate() {
                    let by_index = format!("{}:{index}", layout.key);
                    let by_name = format!("{}:{}", layout.key, canonical_key(&field.name));
                    if !selection.pattern_matches(&by_index) && !selection.pattern_matches(&by_name)
                    {
                        continue;
                    }
                    if self.slots.contains_key(&by_index) {
                        continue;
                    }
                    match self.admit(&layout, index, registry) {
                        Ok(Some(register)) => discovery.resolved.push(register),
                        Ok(None) => {}
                        Err(AdmitError::Transient) => discovery.complete = false,
                        Err(AdmitError::Permanent(e)) => self.fail(&by_index, e),
                    }
                }
            }
        }
    }

    /// Put a resolved register into the catalog, creating its device if necessary.
    ///
    /// `Ok(None)` if the register is already there.
    fn admit(
        &mut self,
        layout: &MessageLayout<'_>,
        index: usize,
        registry: &mut dyn DeviceRegistry,
    ) -> Result<Option<Register>, AdmitError> {
        let register = Register { message: layout.key.clone(), field_index: index };
        let key = register.to_string();
        if self.slots.contains_key(&key) {
            return Ok(None);
        }
        let field = layout.fields[index];
        let has_values = field.value_names().next().is_some();
        let kind = Kind::resolve(field.class(), has_values, layout.writable).unwrap_or(Kind::Text);
        let options = match kind {
            Kind::Selector => OptionTable::selector(field.value_names(), layout.writable),
            _ => OptionTable::default(),
        };
        let unit = match kind {
            Kind::Number
            | Kind::Custom
            | Kind::TemperatureSetpoint
            | Kind::TemperatureReadOnly
            | Kind::Pressure => field.unit.clone(),
            _ => String::new(),
        };
        let name = if layout.fields.len() > 1 && !field.name.is_empty() {
            format!("{} {}", layout.message_name, field.name)
        } else {
            layout.message_name.to_string()
        };
        let spec = DeviceSpec {
            key: key.clone(),
            name,
            kind,
            unit,
            levels: options.levels.clone(),
            settable: layout.writable,
            comment: field.comment.clone(),
        };
        let (device, force_refresh) = match registry.find(&key) {
            Some(existing) => {
                info!(message = "found device", register = key, comment = spec.comment);
                let reconfigure = existing.spec != spec;
                if existing.spec.kind != kind {
                    info!(
                        message = "device kind changed, will reconfigure",
                        register = key,
                        was = %existing.spec.kind,
                        now = %kind,
                    );
                } else if reconfigure {
                    info!(message = "device presentation changed, will reconfigure", register = key);
                }
                (existing.id, reconfigure)
            }
            None => match registry.create(&spec) {
                Ok(id) => {
                    info!(
                        message = "created device",
                        register = key,
                        kind = %kind,
                        comment = spec.comment
                    );
                    (id, false)
                }
                Err(e @ RegistryError::CapacityExhausted(_)) => {
                    return Err(AdmitError::Permanent(ResolveError::TooManyDevices(e, key)));
                }
                Err(e) => {
                    warn!(
                        message = "could not create device, will retry",
                        register = key,
                        error = (&e as &dyn std::error::Error)
                    );
                    return Err(AdmitError::Transient);
                }
            },
        };
        self.rows.entry(layout.key.clone()).or_insert_with(|| MessageRow {
            circuit_name: layout.circuit_name.to_string(),
            message_name: layout.message_name.to_string(),
            field_count: layout.fields.len(),
            values: None,
            updated: None,
        });
        debug!(message = "register resolved", register = key, field_count = layout.fields.len());
        let entry = RegisterEntry {
            register: register.clone(),
            device,
            spec,
            options,
            field_count: layout.fields.len(),
            force_refresh,
            always_refresh: kind.always_refresh(),
            last_seen: None,
        };
        self.slots.insert(key, Slot::Resolved(entry));
        Ok(Some(register))
    }

    fn fail(&mut self, key: &str, e: ResolveError) {
        if self.slots.contains_key(key) {
            return;
        }
        error!(
            message = "register cannot be bridged",
            register = key,
            error = (&e as &dyn std::error::Error)
        );
        self.slots.insert(key.to_string(), Slot::Failed(e));
    }
}
