use std::time::Duration;

use ebusd_homie_bridge::bridge::{
    Action, Bridge, ConnectionState, Event, Operation, Settings, WriteRequest,
};
use ebusd_homie_bridge::catalog::MessageKey;
use ebusd_homie_bridge::ebusd::{Request, Response};
use ebusd_homie_bridge::fields::Kind;
use ebusd_homie_bridge::registry::{DeviceRegistry, DeviceSpec, MemoryRegistry};
use ebusd_homie_bridge::selection::Selection;
use ebusd_homie_bridge::value::{DeviceValue, SetValue};
use tokio::time::Instant;

const DOCUMENT: &str = r#"{
    "global": {"version": "ebusd 23.2", "signal": true},
    "f47": {
        "name": "f47",
        "messages": {
            "OutsideTemp": {
                "name": "OutsideTemp",
                "passive": false,
                "write": false,
                "fielddefs": [
                    {"name": "temp", "slave": false, "type": "D2C", "isAdjustable": false,
                     "isIgnored": false, "unit": "°C", "comment": "outside temperature"},
                    {"name": "sensor", "type": "STR", "unit": "", "comment": "sensor status"}
                ]
            },
            "Hc1OpMode": {
                "name": "Hc1OpMode",
                "fielddefs": [{"name": "mode", "type": "UCH", "unit": "", "comment": "",
                               "values": {"0": "off", "1": "auto", "2": "day", "3": "night"}}]
            },
            "Hc1OpMode-w": {
                "name": "Hc1OpMode",
                "write": true,
                "fielddefs": [{"name": "mode", "type": "UCH", "unit": "", "comment": "operating mode",
                               "values": {"0": "off", "1": "auto", "2": "day", "3": "night"}}]
            },
            "Hc1Pump": {
                "name": "Hc1Pump",
                "fielddefs": [{"name": "onoff", "type": "UCH", "unit": "", "comment": ""}]
            },
            "Hc1Pump-w": {
                "name": "Hc1Pump",
                "write": true,
                "fielddefs": [{"name": "onoff", "type": "UCH", "unit": "", "comment": ""}]
            },
            "Hc1Timer": {
                "name": "Hc1Timer",
                "fielddefs": [
                    {"name": "from", "type": "HTM", "unit": "", "comment": ""},
                    {"name": "to", "type": "HTM", "unit": "", "comment": ""}
                ]
            },
            "Hc1Timer-w": {
                "name": "Hc1Timer",
                "write": true,
                "fielddefs": [
                    {"name": "from", "type": "HTM", "unit": "", "comment": ""},
                    {"name": "to", "type": "HTM", "unit": "", "comment": ""}
                ]
            }
        }
    }
}"#;

fn response(text: &str) -> Event {
    Event::DataReceived(Response(format!("{text}\n\n")))
}

fn read(message: &str) -> Action {
    Action::Send(Request::Read { circuit: "f47".into(), message: message.into(), force: false })
}

fn write(message: &str, value: &str) -> Action {
    Action::Send(Request::Write {
        circuit: "f47".into(),
        message: message.into(),
        value: value.into(),
    })
}

fn bridge_with(
    settings: Settings,
    expression: &str,
    registry: MemoryRegistry,
    now: Instant,
) -> Bridge<MemoryRegistry> {
    let selection = Selection::parse(expression).unwrap();
    let mut bridge = Bridge::new(settings, selection, registry, now);
    assert_eq!(bridge.start(now), vec![Action::FetchDiscovery]);
    bridge
}

/// A bridge that has discovered `expression` and is connected, with the first read outstanding.
fn connected(settings: Settings, expression: &str, now: Instant) -> Bridge<MemoryRegistry> {
    let mut bridge = bridge_with(settings, expression, MemoryRegistry::new(32), now);
    let actions = bridge.handle_event(Event::DiscoveryReceived(DOCUMENT.into()), now);
    assert_eq!(actions, vec![Action::Connect]);
    assert_eq!(bridge.state(), ConnectionState::Connecting);
    let actions = bridge.handle_event(Event::ConnectionOpened, now);
    assert_eq!(actions.len(), 1);
    assert_eq!(bridge.state(), ConnectionState::Sending);
    bridge
}

fn device_value(bridge: &Bridge<MemoryRegistry>, key: &str) -> Option<DeviceValue> {
    bridge.registry().by_key(key).and_then(|d| d.value.clone())
}

#[test]
fn first_read_populates_device_and_row() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:OutsideTemp", t0);
    assert!(matches!(bridge.in_flight(), Some(c) if c.operation == Operation::Read));

    let actions = bridge.handle_event(response("f47 OutsideTemp temp=9.56;sensor=ok"), t0);
    assert!(actions.is_empty());
    assert_eq!(bridge.state(), ConnectionState::Connected);
    assert!(bridge.in_flight().is_none());
    assert_eq!(device_value(&bridge, "f47:outsidetemp:0"), Some(DeviceValue::new(9, "9.56")));

    let row = bridge.catalog().row(&MessageKey::new("f47", "OutsideTemp")).unwrap();
    assert_eq!(row.values, Some(vec!["9.56".to_string(), "ok".to_string()]));
    assert_eq!(row.updated, Some(t0));
    assert_eq!(row.field_count, 2);
}

#[test]
fn one_response_updates_every_field_of_the_message() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:OutsideTemp:0 f47:OutsideTemp:1", t0);

    let actions = bridge.handle_event(response("f47 OutsideTemp temp=9.56;sensor=ok"), t0);
    assert_eq!(device_value(&bridge, "f47:outsidetemp:0"), Some(DeviceValue::new(9, "9.56")));
    assert_eq!(device_value(&bridge, "f47:outsidetemp:1"), Some(DeviceValue::new(0, "ok")));
    // The second register's own first read is still queued.
    assert_eq!(actions, vec![read("OutsideTemp")]);
    bridge.handle_event(response("f47 OutsideTemp temp=9.56;sensor=ok"), t0);
    assert_eq!(bridge.state(), ConnectionState::Connected);

    // Both registers share a row, so a refresh reads the message once.
    let t1 = t0 + Duration::from_secs(600);
    assert_eq!(bridge.handle_event(Event::TickElapsed, t1), vec![read("OutsideTemp")]);
    let actions = bridge.handle_event(response("f47 OutsideTemp temp=10.1;sensor=ok"), t1);
    assert!(actions.is_empty());
    assert_eq!(device_value(&bridge, "f47:outsidetemp:0"), Some(DeviceValue::new(10, "10.1")));
    assert_eq!(device_value(&bridge, "f47:outsidetemp:1"), Some(DeviceValue::new(0, "ok")));
    let row = bridge.catalog().row(&MessageKey::new("f47", "OutsideTemp")).unwrap();
    assert_eq!(row.values, Some(vec!["10.1".to_string(), "ok".to_string()]));
    assert_eq!(row.updated, Some(t1));
}

#[test]
fn responses_with_the_wrong_field_count_are_discarded() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:OutsideTemp:0 f47:OutsideTemp:1", t0);
    bridge.handle_event(response("f47 OutsideTemp temp=9.56;sensor=ok"), t0);
    bridge.handle_event(response("f47 OutsideTemp temp=9.56;sensor=ok"), t0);

    let t1 = t0 + Duration::from_secs(600);
    assert_eq!(bridge.handle_event(Event::TickElapsed, t1), vec![read("OutsideTemp")]);
    let actions = bridge.handle_event(response("f47 OutsideTemp temp=1"), t1);
    assert!(actions.is_empty());
    assert_eq!(bridge.state(), ConnectionState::Connected);
    assert!(bridge.in_flight().is_none());
    assert_eq!(device_value(&bridge, "f47:outsidetemp:0"), Some(DeviceValue::new(9, "9.56")));
    assert_eq!(device_value(&bridge, "f47:outsidetemp:1"), Some(DeviceValue::new(0, "ok")));
    let row = bridge.catalog().row(&MessageKey::new("f47", "OutsideTemp")).unwrap();
    assert_eq!(row.values, Some(vec!["9.56".to_string(), "ok".to_string()]));
    assert_eq!(row.updated, Some(t0));
}

#[test]
fn commands_are_sent_one_at_a_time_in_order() {
    let t0 = Instant::now();
    let mut bridge = bridge_with(
        Settings::default(),
        "f47:OutsideTemp f47:Hc1OpMode|f47:Hc1Pump",
        MemoryRegistry::new(32),
        t0,
    );
    let actions = bridge.handle_event(Event::DiscoveryReceived(DOCUMENT.into()), t0);
    assert_eq!(actions, vec![Action::Connect]);
    assert_eq!(bridge.queue().count(), 3);

    assert_eq!(bridge.handle_event(Event::ConnectionOpened, t0), vec![read("OutsideTemp")]);
    assert_eq!(bridge.queue().count(), 2);
    // Nothing else goes out while a response is outstanding.
    assert!(bridge.handle_event(Event::TickElapsed, t0).is_empty());
    assert_eq!(
        bridge.handle_event(response("f47 OutsideTemp temp=9.56;sensor=ok"), t0),
        vec![read("Hc1OpMode")]
    );
    assert_eq!(
        bridge.handle_event(response("f47 Hc1OpMode mode=auto"), t0),
        vec![read("Hc1Pump")]
    );
    assert!(bridge.handle_event(response("f47 Hc1Pump onoff=on"), t0).is_empty());
    assert_eq!(bridge.state(), ConnectionState::Connected);

    assert_eq!(device_value(&bridge, "f47:hc1opmode:0"), Some(DeviceValue::new(2, "20")));
    assert_eq!(device_value(&bridge, "f47:hc1pump:0"), Some(DeviceValue::new(1, "100")));
}

#[test]
fn cache_bypass_reads() {
    let t0 = Instant::now();
    let settings = Settings { no_cache: true, ..Settings::default() };
    let mut bridge = bridge_with(settings, "f47:OutsideTemp", MemoryRegistry::new(4), t0);
    bridge.handle_event(Event::DiscoveryReceived(DOCUMENT.into()), t0);
    assert_eq!(
        bridge.handle_event(Event::ConnectionOpened, t0),
        vec![Action::Send(Request::Read {
            circuit: "f47".into(),
            message: "OutsideTemp".into(),
            force: true,
        })]
    );
}

#[test]
fn single_field_write_is_followed_by_a_read() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:Hc1OpMode", t0);
    bridge.handle_event(response("f47 Hc1OpMode mode=auto"), t0);

    let request = WriteRequest {
        register: "f47:hc1opmode:0".into(),
        value: SetValue::new("set level", 30, "day"),
    };
    let actions = bridge.handle_event(Event::WriteRequested(request), t0);
    assert_eq!(actions, vec![write("Hc1OpMode", "day")]);
    assert_eq!(bridge.queue().count(), 1);
    assert_eq!(bridge.handle_event(response("done"), t0), vec![read("Hc1OpMode")]);
    assert!(bridge.handle_event(response("f47 Hc1OpMode mode=day"), t0).is_empty());
    assert_eq!(device_value(&bridge, "f47:hc1opmode:0"), Some(DeviceValue::new(2, "30")));
}

#[test]
fn switch_toggle_uses_previous_value() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:Hc1Pump", t0);
    bridge.handle_event(response("f47 Hc1Pump onoff=on"), t0);
    let request = WriteRequest {
        register: "f47:hc1pump:0".into(),
        value: SetValue::new("toggle", 0, ""),
    };
    assert_eq!(
        bridge.handle_event(Event::WriteRequested(request), t0),
        vec![write("Hc1Pump", "off")]
    );
}

#[test]
fn multi_field_write_splices_fresh_row() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:Hc1Timer:1", t0);
    bridge.handle_event(response("f47 Hc1Timer from=06:00;to=22:00"), t0);
    assert_eq!(device_value(&bridge, "f47:hc1timer:1"), Some(DeviceValue::new(0, "22:00")));

    let t1 = t0 + Duration::from_secs(120);
    let request = WriteRequest {
        register: "f47:hc1timer:1".into(),
        value: SetValue::new("set", 0, "23:30"),
    };
    // The row is refreshed first, then written, then read back.
    assert_eq!(bridge.handle_event(Event::WriteRequested(request), t1), vec![read("Hc1Timer")]);
    assert_eq!(bridge.queue().count(), 2);
    let t2 = t1 + Duration::from_secs(1);
    assert_eq!(
        bridge.handle_event(response("f47 Hc1Timer from=06:30;to=22:00"), t2),
        vec![write("Hc1Timer", "06:30;23:30")]
    );
    assert_eq!(bridge.handle_event(response("done"), t2), vec![read("Hc1Timer")]);
}

#[test]
fn multi_field_write_with_stale_row_is_dropped() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:Hc1Timer:1", t0);
    bridge.handle_event(response("f47 Hc1Timer from=06:00;to=22:00"), t0);

    let t1 = t0 + Duration::from_secs(60);
    let request = WriteRequest {
        register: "f47:hc1timer:1".into(),
        value: SetValue::new("set", 0, "23:30"),
    };
    assert_eq!(bridge.handle_event(Event::WriteRequested(request), t1), vec![read("Hc1Timer")]);
    // The refreshing read fails, so the row is as old as the first read and the write is skipped.
    let actions = bridge.handle_event(response("ERR: element not found"), t1);
    assert_eq!(actions, vec![read("Hc1Timer")]);
    assert_eq!(bridge.queue().count(), 0);
}

#[test]
fn unusable_writes_are_dropped() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:OutsideTemp", t0);
    bridge.handle_event(response("f47 OutsideTemp temp=9.56;sensor=ok"), t0);

    let unknown = WriteRequest { register: "f47:nothing:0".into(), value: SetValue::new("on", 1, "") };
    assert!(bridge.handle_event(Event::WriteRequested(unknown), t0).is_empty());
    let read_only = WriteRequest {
        register: "f47:outsidetemp:0".into(),
        value: SetValue::new("set", 10, "10"),
    };
    assert!(bridge.handle_event(Event::WriteRequested(read_only), t0).is_empty());
    assert_eq!(bridge.queue().count(), 0);
}

#[test]
fn read_only_mode_makes_nothing_settable() {
    let t0 = Instant::now();
    let settings = Settings { read_only: true, ..Settings::default() };
    let mut bridge = connected(settings, "f47:Hc1OpMode", t0);
    bridge.handle_event(response("f47 Hc1OpMode mode=auto"), t0);
    let device = bridge.registry().by_key("f47:hc1opmode:0").unwrap();
    assert!(!device.spec.settable);
    // Read-only selectors report the option itself.
    assert_eq!(device.value, Some(DeviceValue::new(2, "auto")));
    let request = WriteRequest {
        register: "f47:hc1opmode:0".into(),
        value: SetValue::new("set level", 30, "day"),
    };
    assert!(bridge.handle_event(Event::WriteRequested(request), t0).is_empty());
}

#[test]
fn error_responses_leave_devices_alone() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:OutsideTemp", t0);
    let actions = bridge.handle_event(response("ERR: no signal"), t0);
    assert!(actions.is_empty());
    assert_eq!(bridge.state(), ConnectionState::Connected);
    assert_eq!(device_value(&bridge, "f47:outsidetemp:0"), None);
}

#[test]
fn unchanged_values_only_touch() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:Hc1OpMode f47:OutsideTemp", t0);
    bridge.handle_event(response("f47 Hc1OpMode mode=auto"), t0);
    bridge.handle_event(response("f47 OutsideTemp temp=9.56;sensor=ok"), t0);

    let t1 = t0 + Duration::from_secs(600);
    assert_eq!(bridge.handle_event(Event::TickElapsed, t1), vec![read("Hc1OpMode")]);
    assert_eq!(
        bridge.handle_event(response("f47 Hc1OpMode mode=auto"), t1),
        vec![read("OutsideTemp")]
    );
    bridge.handle_event(response("f47 OutsideTemp temp=9.56;sensor=ok"), t1);

    let selector = bridge.registry().by_key("f47:hc1opmode:0").unwrap();
    assert_eq!((selector.updates, selector.changes, selector.touches), (1, 1, 1));
    // Read-only temperatures are pushed every time.
    let sensor = bridge.registry().by_key("f47:outsidetemp:0").unwrap();
    assert_eq!((sensor.updates, sensor.changes, sensor.touches), (2, 1, 0));

    let t2 = t1 + Duration::from_secs(600);
    bridge.handle_event(Event::TickElapsed, t2);
    bridge.handle_event(response("f47 Hc1OpMode mode=night"), t2);
    let selector = bridge.registry().by_key("f47:hc1opmode:0").unwrap();
    assert_eq!((selector.updates, selector.changes), (2, 2));
    assert_eq!(selector.value, Some(DeviceValue::new(2, "40")));
}

#[test]
fn stale_devices_time_out_and_recover() {
    let t0 = Instant::now();
    let settings = Settings { stale_after: Duration::from_secs(60), ..Settings::default() };
    let mut bridge = connected(settings, "f47:Hc1OpMode", t0);
    bridge.handle_event(response("f47 Hc1OpMode mode=auto"), t0);

    assert!(bridge.handle_event(Event::TickElapsed, t0 + Duration::from_secs(30)).is_empty());
    assert!(!bridge.registry().by_key("f47:hc1opmode:0").unwrap().timed_out);
    assert!(bridge.handle_event(Event::TickElapsed, t0 + Duration::from_secs(61)).is_empty());
    assert!(bridge.registry().by_key("f47:hc1opmode:0").unwrap().timed_out);

    let t1 = t0 + Duration::from_secs(600);
    assert_eq!(bridge.handle_event(Event::TickElapsed, t1), vec![read("Hc1OpMode")]);
    bridge.handle_event(response("f47 Hc1OpMode mode=auto"), t1);
    let device = bridge.registry().by_key("f47:hc1opmode:0").unwrap();
    assert!(!device.timed_out);
    // The unchanged value is pushed in full to clear the time out, but not recorded as a change.
    assert_eq!((device.updates, device.changes, device.touches), (2, 1, 0));
}

#[test]
fn stuck_connection_restarts_everything() {
    let t0 = Instant::now();
    let mut bridge = bridge_with(Settings::default(), "f47:OutsideTemp", MemoryRegistry::new(4), t0);
    assert_eq!(
        bridge.handle_event(Event::DiscoveryReceived(DOCUMENT.into()), t0),
        vec![Action::Connect]
    );
    assert!(bridge.handle_event(Event::ConnectionFailed, t0).is_empty());
    assert_eq!(bridge.state(), ConnectionState::Connecting);
    assert!(bridge.handle_event(Event::TickElapsed, t0 + Duration::from_secs(5)).is_empty());

    let t1 = t0 + Duration::from_secs(11);
    let actions = bridge.handle_event(Event::TickElapsed, t1);
    assert_eq!(actions, vec![Action::Disconnect, Action::FetchDiscovery]);
    assert_eq!(bridge.state(), ConnectionState::Idle);
    assert_eq!(bridge.queue().count(), 0);
    assert_eq!(bridge.catalog().entries().count(), 0);
    assert!(bridge.is_discovery_pending());

    // Devices outlive the restart and are found again.
    let actions = bridge.handle_event(Event::DiscoveryReceived(DOCUMENT.into()), t1);
    assert_eq!(actions, vec![Action::Connect]);
    assert_eq!(bridge.registry().devices().count(), 1);
}

#[test]
fn closed_connection_reconnects_for_queued_work() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:OutsideTemp f47:Hc1Pump", t0);
    let actions = bridge.handle_event(Event::ConnectionClosed, t0);
    assert_eq!(actions, vec![Action::Connect]);
    assert!(bridge.in_flight().is_none());
    assert_eq!(bridge.handle_event(Event::ConnectionOpened, t0), vec![read("Hc1Pump")]);
}

#[test]
fn incomplete_discovery_is_retried_on_refresh() {
    let t0 = Instant::now();
    let mut bridge = connected(Settings::default(), "f47:OutsideTemp f47:NotYetThere", t0);
    assert!(!bridge.catalog().is_complete());
    assert!(!bridge.is_discovery_pending());
    bridge.handle_event(response("f47 OutsideTemp temp=9.56;sensor=ok"), t0);

    let t1 = t0 + Duration::from_secs(600);
    assert_eq!(
        bridge.handle_event(Event::TickElapsed, t1),
        vec![Action::FetchDiscovery, read("OutsideTemp")]
    );
    assert!(bridge.handle_event(Event::DiscoveryFailed, t1).is_empty());
    assert!(!bridge.is_discovery_pending());
}

#[test]
fn malformed_and_unresolvable_terms_fail_permanently() {
    let t0 = Instant::now();
    let mut bridge = bridge_with(
        Settings::default(),
        "f47 f47:OutsideTemp:7 f47:OutsideTemp:humidity",
        MemoryRegistry::new(4),
        t0,
    );
    assert!(bridge.handle_event(Event::DiscoveryReceived(DOCUMENT.into()), t0).is_empty());
    assert!(bridge.catalog().is_complete());
    assert_eq!(bridge.catalog().failures().count(), 3);
    assert_eq!(bridge.catalog().entries().count(), 0);
}

#[test]
fn changed_kind_reconfigures_existing_device() {
    let t0 = Instant::now();
    let mut registry = MemoryRegistry::new(4);
    let id = registry
        .create(&DeviceSpec {
            key: "f47:hc1opmode:0".into(),
            name: "Hc1OpMode".into(),
            kind: Kind::Number,
            unit: String::new(),
            levels: Vec::new(),
            settable: false,
            comment: String::new(),
        })
        .unwrap();
    let mut bridge = bridge_with(Settings::default(), "f47:Hc1OpMode", registry, t0);
    bridge.handle_event(Event::DiscoveryReceived(DOCUMENT.into()), t0);
    bridge.handle_event(Event::ConnectionOpened, t0);
    bridge.handle_event(response("f47 Hc1OpMode mode=auto"), t0);

    let device = bridge.registry().device(id).unwrap();
    assert_eq!(device.spec.kind, Kind::Selector);
    assert_eq!(device.spec.levels, ["off", "auto", "day", "night"]);
    assert!(device.spec.settable);
    assert_eq!(bridge.registry().devices().count(), 1);
}
