//! The command queue and the state machine around the single ebusd command connection.
//!
//! [`Bridge`] doesn't do any IO on its own. Everything that happens (a connection opening, data
//! arriving, a timer ticking, a write being requested) is fed to [`Bridge::handle_event`], which
//! runs to completion and returns the [`Action`]s the caller must carry out. At most one request
//! is outstanding on the connection at any time.
mod scheduler;

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::catalog::{Catalog, MessageKey, Register, RegisterEntry};
use crate::ebusd::{self, Request, Response};
use crate::registry::{DeviceRegistry, DeviceUpdate};
use crate::schema::Schema;
use crate::selection::Selection;
use crate::value::{self, DeviceValue, SetValue};

#[derive(Clone, Debug)]
pub struct Settings {
    /// How often every resolved message is read.
    pub refresh_rate: Duration,
    /// Restart everything if the connection makes no progress for this long while work is queued.
    pub stuck_timeout: Duration,
    /// How old a message row may be for a single field of it to be written.
    pub write_staleness: Duration,
    /// Mark devices timed out when they haven't been read for this long.
    pub stale_after: Duration,
    /// Bypass ebusd's cache when reading.
    pub no_cache: bool,
    pub read_only: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_rate: Duration::from_secs(600),
            stuck_timeout: Duration::from_secs(10),
            write_staleness: Duration::from_secs(10),
            stale_after: Duration::from_secs(1800),
            no_cache: false,
            read_only: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ConnectionState {
    /// No connection.
    Idle,
    Connecting,
    /// Connected, nothing outstanding.
    Connected,
    /// A request has been sent and its response hasn't arrived yet.
    Sending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Read,
    /// Write the bus value of the target field.
    Write(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub operation: Operation,
    pub target: Register,
}

impl Command {
    pub fn read(target: Register) -> Self {
        Self { operation: Operation::Read, target }
    }

    pub fn write(target: Register, value: String) -> Self {
        Self { operation: Operation::Write(value), target }
    }
}

/// A change requested for the device of a register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    /// The `circuit:message:index` register key.
    pub register: String,
    pub value: SetValue,
}

#[derive(Debug)]
pub enum Event {
    ConnectionOpened,
    ConnectionClosed,
    ConnectionFailed,
    DataReceived(Response),
    TickElapsed,
    WriteRequested(WriteRequest),
    /// The body of the discovery document.
    DiscoveryReceived(String),
    DiscoveryFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the command connection.
    Connect,
    /// Drop the command connection, if any.
    Disconnect,
    Send(Request),
    /// Fetch the discovery document; answer with `DiscoveryReceived` or `DiscoveryFailed`.
    FetchDiscovery,
}

pub struct Bridge<R> {
    settings: Settings,
    selection: Selection,
    registry: R,
    catalog: Catalog,
    queue: VecDeque<Command>,
    in_flight: Option<Command>,
    state: ConnectionState,
    state_since: Instant,
    discovery_pending: bool,
    last_refresh: Option<Instant>,
    actions: Vec<Action>,
}

impl<R: DeviceRegistry> Bridge<R> {
    pub fn new(settings: Settings, selection: Selection, registry: R, now: Instant) -> Self {
        Self {
            settings,
            selection,
            registry,
            catalog: Catalog::default(),
            queue: VecDeque::new(),
            in_flight: None,
            state: ConnectionState::Idle,
            state_since: now,
            discovery_pending: false,
            last_refresh: None,
            actions: Vec::new(),
        }
    }

    /// Kick off the first discovery.
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        self.last_refresh = Some(now);
        self.request_discovery();
        std::mem::take(&mut self.actions)
    }

    pub fn handle_event(&mut self, event: Event, now: Instant) -> Vec<Action> {
        trace!(message = "handling event", ?event, state = %self.state);
        match event {
            Event::ConnectionOpened => {
                if self.state == ConnectionState::Connecting {
                    info!("connected to ebusd");
                    self.transition(ConnectionState::Connected, now);
                } else {
                    debug!(message = "unexpected connection", state = %self.state);
                }
                self.advance(now);
            }
            Event::ConnectionClosed => {
                if let Some(command) = self.in_flight.take() {
                    warn!(message = "connection closed with a request outstanding", ?command);
                } else {
                    debug!("connection closed");
                }
                self.transition(ConnectionState::Idle, now);
                self.advance(now);
            }
            // Stay in `Connecting`: if the queue has work, the stuck timeout takes care of it.
            Event::ConnectionFailed => warn!("could not connect to ebusd"),
            Event::DataReceived(response) => self.handle_response(response, now),
            Event::TickElapsed => self.tick(now),
            Event::WriteRequested(request) => self.request_write(request, now),
            Event::DiscoveryReceived(body) => {
                self.discovery_pending = false;
                match Schema::parse(&body) {
                    Ok(schema) => self.apply_schema(&schema, now),
                    Err(e) => warn!(
                        message = "could not parse the discovery document, will retry",
                        error = (&e as &dyn std::error::Error)
                    ),
                }
            }
            Event::DiscoveryFailed => {
                self.discovery_pending = false;
                debug!("discovery failed, will retry");
            }
        }
        std::mem::take(&mut self.actions)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn queue(&self) -> impl Iterator<Item = &Command> {
        self.queue.iter()
    }

    pub fn in_flight(&self) -> Option<&Command> {
        self.in_flight.as_ref()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut R {
        &mut self.registry
    }

    pub fn is_discovery_pending(&self) -> bool {
        self.discovery_pending
    }

    fn transition(&mut self, state: ConnectionState, now: Instant) {
        trace!(message = "connection state", from = %self.state, to = %state);
        self.state = state;
        self.state_since = now;
    }

    fn request_discovery(&mut self) {
        if !self.discovery_pending {
            self.discovery_pending = true;
            self.actions.push(Action::FetchDiscovery);
        }
    }

    fn apply_schema(&mut self, schema: &Schema, now: Instant) {
        let discovery = self.catalog.apply_discovery(
            schema,
            &self.selection,
            self.settings.read_only,
            &mut self.registry,
        );
        info!(
            message = "discovery applied",
            resolved = discovery.resolved.len(),
            complete = discovery.complete
        );
        for register in discovery.resolved {
            self.enqueue(Command::read(register), now);
        }
    }

    fn enqueue(&mut self, command: Command, now: Instant) {
        trace!(message = "enqueued", ?command);
        self.queue.push_back(command);
        self.advance(now);
    }

    /// Move the connection forward if it is able to take on more work.
    fn advance(&mut self, now: Instant) {
        if self.queue.is_empty() {
            return;
        }
        match self.state {
            ConnectionState::Idle => {
                info!("connecting to ebusd");
                self.transition(ConnectionState::Connecting, now);
                self.actions.push(Action::Connect);
            }
            ConnectionState::Connected => {
                while let Some(command) = self.queue.pop_front() {
                    let Some(request) = self.request_for(&command, now) else {
                        continue;
                    };
                    debug!(message = "sending", request = %request);
                    self.in_flight = Some(command);
                    self.transition(ConnectionState::Sending, now);
                    self.actions.push(Action::Send(request));
                    return;
                }
            }
            ConnectionState::Connecting | ConnectionState::Sending => {}
        }
    }

    /// The request to send for a command. `None` if the command must be dropped.
    fn request_for(&self, command: &Command, now: Instant) -> Option<Request> {
        let key = command.target.to_string();
        let (Some(entry), Some(row)) =
            (self.catalog.entry(&key), self.catalog.row(&command.target.message))
        else {
            warn!(message = "dropping a command for an unknown register", register = key);
            return None;
        };
        let (circuit, message) = (row.circuit_name.clone(), row.message_name.clone());
        let value = match &command.operation {
            Operation::Read => {
                return Some(Request::Read { circuit, message, force: self.settings.no_cache });
            }
            Operation::Write(value) if entry.field_count <= 1 => value.clone(),
            Operation::Write(value) => {
                let Some(values) = row.fresh(now, self.settings.write_staleness) else {
                    error!(
                        message = "cached fields are too old or missing, not writing a field of a \
                                   multi-field message",
                        register = key
                    );
                    return None;
                };
                if values.len() != entry.field_count {
                    error!(
                        message = "cached fields don't match the message, not writing",
                        register = key,
                        expected = entry.field_count,
                        actual = values.len()
                    );
                    return None;
                }
                let mut values = values.to_vec();
                if let Some(field) = values.get_mut(entry.register.field_index) {
                    *field = value.clone();
                }
                values.join(";")
            }
        };
        Some(Request::Write { circuit, message, value })
    }

    fn handle_response(&mut self, response: Response, now: Instant) {
        let Some(command) = self.in_flight.take() else {
            debug!(message = "a response we were not expecting", response = response.first_line());
            return;
        };
        if let Some(error) = response.error() {
            warn!(message = "ebusd reported an error", ?command, error);
        } else {
            match command.operation {
                Operation::Read => self.apply_read(response.first_line(), now),
                Operation::Write(_) => {
                    debug!(message = "write acknowledged", response = response.first_line())
                }
            }
        }
        self.transition(ConnectionState::Connected, now);
        self.advance(now);
    }

    /// Store the row of a read response and push its values into every device of the message.
    fn apply_read(&mut self, line: &str, now: Instant) {
        let parsed = match ebusd::parse_read_line(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(message = "unparsable response", error = (&e as &dyn std::error::Error));
                return;
            }
        };
        let key = MessageKey::new(parsed.circuit, parsed.message);
        let Some(row) = self.catalog.row_mut(&key) else {
            warn!(message = "response for a message that isn't bridged", message_key = %key);
            return;
        };
        if let Err(e) = parsed.expect_fields(row.field_count) {
            warn!(
                message = "discarding response",
                message_key = %key,
                error = (&e as &dyn std::error::Error)
            );
            return;
        }
        row.store(parsed.values.iter().map(|v| v.to_string()).collect(), now);
        for entry in self.catalog.entries_mut().filter(|e| e.register.message == key) {
            let Some(raw) = parsed.values.get(entry.register.field_index) else {
                continue;
            };
            let value = value::from_bus(&entry.options, raw);
            push_value(&mut self.registry, entry, value, now);
        }
    }

    fn request_write(&mut self, request: WriteRequest, now: Instant) {
        let Some(entry) = self.catalog.entry(&request.register) else {
            warn!(message = "write for an unknown register", register = request.register);
            return;
        };
        if !entry.settable() {
            warn!(message = "register is not writable, ignoring", register = request.register);
            return;
        }
        let previous = self
            .registry
            .snapshot(entry.device)
            .and_then(|s| s.value)
            .map(|v| v.numeric)
            .unwrap_or(0);
        let bus_value = value::to_bus(entry.kind(), &entry.options, &request.value, previous);
        info!(message = "writing", register = request.register, value = bus_value);
        let target = entry.register.clone();
        if entry.field_count > 1 {
            self.enqueue(Command::read(target.clone()), now);
        }
        self.enqueue(Command::write(target.clone(), bus_value), now);
        self.enqueue(Command::read(target), now);
    }

    /// Throw everything away and start over, as if the process had been restarted.
    ///
    /// Devices live in the registry and survive this.
    fn restart(&mut self, now: Instant) {
        error!(
            message = "ebusd connection is stuck, restarting",
            state = %self.state,
            queued = self.queue.len()
        );
        self.catalog = Catalog::default();
        self.queue.clear();
        self.in_flight = None;
        self.discovery_pending = false;
        self.actions.push(Action::Disconnect);
        self.transition(ConnectionState::Idle, now);
        self.last_refresh = Some(now);
        self.request_discovery();
    }
}

/// Push a freshly read value into a device, unless doing so would be redundant.
///
/// A full update happens when the value changed, when the device must be reconfigured, when the
/// register always refreshes, or to clear a timed out device. Otherwise the device is only marked
/// alive.
fn push_value<R: DeviceRegistry>(
    registry: &mut R,
    entry: &mut RegisterEntry,
    value: DeviceValue,
    now: Instant,
) {
    let snapshot = registry.snapshot(entry.device).unwrap_or_default();
    let changed = snapshot.value.as_ref() != Some(&value);
    if changed || entry.force_refresh || entry.always_refresh || snapshot.timed_out {
        trace!(message = "updating device", register = %entry.register, ?value, changed);
        let reconfigure = entry.force_refresh.then(|| entry.spec.clone());
        registry.update(entry.device, DeviceUpdate { value, log_change: changed, reconfigure });
    } else {
        registry.touch(entry.device);
    }
    entry.force_refresh = false;
    entry.last_seen = Some(now);
}
