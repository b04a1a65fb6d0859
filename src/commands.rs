pub mod run {
    use std::time::Duration;

    use homie5::{Homie5DeviceProtocol, HomieDomain, HomieID};
    use tokio::time::Instant;

    use crate::bridge::{Bridge, Settings};
    use crate::homie::{self, HomieRegistry};
    use crate::selection::{self, Selection};
    use crate::{connection, service};

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not parse the register selection")]
        Selection(#[source] selection::Error),
        #[error("`{1}` is not a valid Homie device ID")]
        DeviceId(#[source] Box<dyn std::error::Error + Send + Sync>, String),
        #[error("could not use `{1}` as the MQTT broker URL")]
        MqttUrl(#[source] Box<dyn std::error::Error + Send + Sync>, String),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("the bridge stopped")]
        Service(#[source] service::Error),
    }

    #[derive(clap::Parser)]
    #[group(id = "run::BridgeArgs")]
    pub struct BridgeArgs {
        /// The registers to bridge, e.g. `bai:Status01:0 f47:Hc1* /mc\..*temp/`.
        #[arg(long)]
        registers: String,

        /// Read every bridged message this often.
        #[arg(long, default_value = "10m")]
        refresh_rate: humantime::Duration,

        /// How often to check for due work.
        #[arg(long, default_value = "10s")]
        tick: humantime::Duration,

        /// Ask ebusd to read from the bus rather than answer from its cache.
        #[arg(long)]
        no_cache: bool,

        /// Do not accept writes.
        #[arg(long)]
        read_only: bool,

        /// Restart everything when the connection to ebusd makes no progress for this long.
        #[arg(long, default_value = "10s")]
        stuck_timeout: humantime::Duration,

        /// Maximum age of the values a single field write of a multi-field message is based on.
        #[arg(long, default_value = "10s")]
        write_staleness: humantime::Duration,

        /// Mark registers timed out after not having been read for this long.
        ///
        /// Three refresh periods by default.
        #[arg(long)]
        stale_after: Option<humantime::Duration>,
    }

    impl BridgeArgs {
        fn settings(&self) -> Settings {
            let refresh_rate: Duration = *self.refresh_rate;
            Settings {
                refresh_rate,
                stuck_timeout: *self.stuck_timeout,
                write_staleness: *self.write_staleness,
                stale_after: self.stale_after.map_or(refresh_rate * 3, |d| *d),
                no_cache: self.no_cache,
                read_only: self.read_only,
            }
        }
    }

    #[derive(clap::Parser)]
    #[group(id = "run::MqttArgs")]
    pub struct MqttArgs {
        /// The MQTT broker, e.g. `mqtt://broker.lan:1883?client_id=ebusd-bridge`.
        #[arg(long)]
        mqtt: String,

        #[arg(long, default_value = "ebusd")]
        device_id: String,

        /// Human readable name of the Homie device. The device ID by default.
        #[arg(long)]
        device_name: Option<String>,

        /// The most registers that will be published.
        #[arg(long, default_value_t = 255)]
        max_devices: usize,
    }

    /// Bridge ebusd registers to a Homie device over MQTT.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        bridge: BridgeArgs,
        #[clap(flatten)]
        mqtt: MqttArgs,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let selection = Selection::parse(&args.bridge.registers).map_err(Error::Selection)?;
        let settings = args.bridge.settings();
        let device_id = HomieID::try_from(args.mqtt.device_id.clone())
            .map_err(|e| Error::DeviceId(Box::new(e), args.mqtt.device_id.clone()))?;
        let (protocol, last_will) = Homie5DeviceProtocol::new(device_id, HomieDomain::Default);
        let mut options = rumqttc::v5::MqttOptions::parse_url(args.mqtt.mqtt.clone())
            .map_err(|e| Error::MqttUrl(Box::new(e), args.mqtt.mqtt.clone()))?;
        options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
            last_will.topic,
            last_will.message,
            homie::convert_qos(last_will.qos),
            last_will.retain,
            None,
        ));
        let name = args.mqtt.device_name.unwrap_or_else(|| args.mqtt.device_id.clone());
        let registry = HomieRegistry::new(protocol, name, args.mqtt.max_devices);
        let tick = *args.bridge.tick;
        let connection = args.connection;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        rt.block_on(async move {
            let (mqtt, eventloop) = rumqttc::v5::AsyncClient::new(options, 64);
            let bridge = Bridge::new(settings, selection, registry, Instant::now());
            service::run(bridge, connection, mqtt, eventloop, tick).await
        })
        .map_err(Error::Service)
    }
}

pub mod catalog {
    use std::path::PathBuf;

    use tracing::warn;

    use crate::catalog::{Catalog, RegisterEntry};
    use crate::connection;
    use crate::fields::Kind;
    use crate::output::{self, Tabular};
    use crate::registry::MemoryRegistry;
    use crate::schema::{self, Schema};
    use crate::selection::{self, Selection};

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not parse the register selection")]
        Selection(#[source] selection::Error),
        #[error("could not read the discovery document at {1:?}")]
        ReadFile(#[source] std::io::Error, PathBuf),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not fetch the discovery document")]
        Fetch(#[source] connection::Error),
        #[error("could not parse the discovery document")]
        Schema(#[source] schema::Error),
        #[error(transparent)]
        Output(output::Error),
    }

    /// Resolve registers against ebusd's message definitions and output what would be bridged.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,

        /// Read the discovery document from this file instead of fetching it from ebusd.
        #[arg(long)]
        file: Option<PathBuf>,

        /// The registers to resolve. Everything ebusd knows about by default.
        #[arg(long)]
        registers: Option<String>,

        /// Resolve registers as if writes were disabled.
        #[arg(long)]
        read_only: bool,
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        register: &'a str,
        name: &'a str,
        kind: Option<Kind>,
        fields: usize,
        settable: bool,
        unit: &'a str,
        options: &'a [String],
        comment: &'a str,
        error: Option<String>,
    }

    impl<'a> Record<'a> {
        fn resolved(entry: &'a RegisterEntry) -> Self {
            Record {
                register: &entry.spec.key,
                name: &entry.spec.name,
                kind: Some(entry.kind()),
                fields: entry.field_count,
                settable: entry.settable(),
                unit: &entry.spec.unit,
                options: &entry.spec.levels,
                comment: &entry.spec.comment,
                error: None,
            }
        }

        fn failed(register: &'a str, error: String) -> Self {
            Record {
                register,
                name: "",
                kind: None,
                fields: 0,
                settable: false,
                unit: "",
                options: &[],
                comment: "",
                error: Some(error),
            }
        }
    }

    impl Tabular for Record<'_> {
        const HEADERS: &'static [&'static str] = &[
            "Register", "Name", "Kind", "Fields", "Settable", "Unit", "Options", "Comment", "Error",
        ];

        fn cells(&self) -> Vec<String> {
            vec![
                self.register.to_string(),
                self.name.to_string(),
                self.kind.map(|k| k.to_string()).unwrap_or_default(),
                self.fields.to_string(),
                if self.settable { "yes".to_string() } else { "no".to_string() },
                self.unit.to_string(),
                self.options.join(", "),
                self.comment.to_string(),
                self.error.clone().unwrap_or_default(),
            ]
        }
    }

    fn load(args: &Args) -> Result<String, Error> {
        if let Some(path) = &args.file {
            return std::fs::read_to_string(path).map_err(|e| Error::ReadFile(e, path.clone()));
        }
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        rt.block_on(async {
            let discovery = connection::Discovery::new(&args.connection).map_err(Error::Fetch)?;
            discovery.fetch().await.map_err(Error::Fetch)
        })
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let selection = match &args.registers {
            Some(expression) => Selection::parse(expression).map_err(Error::Selection)?,
            None => Selection::all(),
        };
        let document = load(&args)?;
        let schema = Schema::parse(&document).map_err(Error::Schema)?;
        let mut catalog = Catalog::default();
        let mut registry = MemoryRegistry::new(usize::MAX);
        let discovery = catalog.apply_discovery(&schema, &selection, args.read_only, &mut registry);
        if !discovery.complete {
            warn!("some of the selected registers are not known to ebusd");
        }

        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers::<Record>().map_err(Error::Output)?;
        for entry in catalog.entries() {
            output.result(&Record::resolved(entry)).map_err(Error::Output)?;
        }
        for (term, error) in catalog.failures() {
            output.result(&Record::failed(term, error.to_string())).map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}
