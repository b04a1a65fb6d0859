use crate::ebusd::EbusdCodec;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` timed out")]
    ConnectTimeout(String),
    #[error("could not construct the HTTP client")]
    CreateReqwest(#[source] reqwest::Error),
    #[error("discovery request to `{1}` failed")]
    DiscoveryRequest(#[source] reqwest::Error, String),
    #[error("discovery request to `{1}` returned an error status")]
    DiscoveryStatus(#[source] reqwest::Error, String),
    #[error("could not read the discovery response from `{1}`")]
    DiscoveryBody(#[source] reqwest::Error, String),
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// The host ebusd is running on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// The port of ebusd's command (telnet) interface.
    #[arg(long, default_value = "8888")]
    telnet_port: u16,

    /// The port of ebusd's HTTP interface, used to discover the available messages.
    #[arg(long, default_value = "8889")]
    http_port: u16,

    /// Give up connecting to the command interface after this long.
    #[arg(long, default_value = "5s")]
    connect_timeout: humantime::Duration,

    /// Give up on a discovery request after this long. Discovery is retried on the next refresh.
    #[arg(long, default_value = "30s")]
    discovery_timeout: humantime::Duration,
}

pub type CommandIo = Framed<TcpStream, EbusdCodec>;

impl Args {
    pub fn telnet_address(&self) -> String {
        format!("{}:{}", self.host, self.telnet_port)
    }

    pub fn discovery_url(&self) -> String {
        format!("http://{}:{}/data?def&write", self.host, self.http_port)
    }
}

/// Open the command connection.
pub async fn connect(args: &Args) -> Result<CommandIo, Error> {
    let address = args.telnet_address();
    info!(message = "connecting...", address);
    let connect = async {
        let addresses = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| Error::LookupHost(e, address.clone()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        TcpStream::connect(&*addresses).await.map_err(|e| Error::Connect(e, address.clone()))
    };
    let socket = tokio::time::timeout(*args.connect_timeout, connect)
        .await
        .map_err(|_| Error::ConnectTimeout(address.clone()))??;
    let nodelay_result = socket.set_nodelay(true);
    trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
    info!(message = "connected", address);
    Ok(Framed::new(socket, EbusdCodec::default()))
}

/// Fetches ebusd's discovery document over HTTP.
#[derive(Clone, Debug)]
pub struct Discovery {
    client: reqwest::Client,
    url: String,
}

impl Discovery {
    pub fn new(args: &Args) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(*args.connect_timeout)
            .timeout(*args.discovery_timeout)
            .build()
            .map_err(Error::CreateReqwest)?;
        Ok(Self { client, url: args.discovery_url() })
    }

    pub async fn fetch(&self) -> Result<String, Error> {
        debug!(message = "fetching the discovery document", url = self.url);
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::DiscoveryRequest(e, self.url.clone()))?;
        let response =
            response.error_for_status().map_err(|e| Error::DiscoveryStatus(e, self.url.clone()))?;
        let body = response.text().await.map_err(|e| Error::DiscoveryBody(e, self.url.clone()))?;
        debug!(message = "fetched the discovery document", length = body.len());
        Ok(body)
    }
}
