//! The event loop driving a [`Bridge`] with real IO.
//!
//! Everything runs on a single task: the command connection, discovery requests, the tick timer
//! and messages from the MQTT broker are turned into [`Event`]s one at a time and the resulting
//! [`Action`]s are carried out before the next event is looked at. The MQTT event loop is polled
//! on a separate task and its events are forwarded over a channel.
use std::collections::VecDeque;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
use rumqttc::v5::mqttbytes::v5::Packet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::bridge::{Action, Bridge, Event};
use crate::connection::{self, CommandIo, Discovery};
use crate::ebusd::Response;
use crate::homie::{self, HomieRegistry, MqttClientExt as _};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not set up discovery")]
    Discovery(#[source] connection::Error),
    #[error("could not publish the Homie device")]
    PublishDevice(#[source] homie::Error),
    #[error("could not publish a property value")]
    Publish(#[source] rumqttc::v5::ClientError),
}

type MqttEvent = Result<rumqttc::v5::Event, rumqttc::v5::ConnectionError>;

/// IO in progress on behalf of the bridge.
struct Io {
    args: connection::Args,
    discovery: Discovery,
    command: Option<CommandIo>,
    connecting: Option<LocalBoxFuture<'static, Result<CommandIo, connection::Error>>>,
    fetching: Option<LocalBoxFuture<'static, Result<String, connection::Error>>>,
}

impl Io {
    /// Carry out an action. Returns the event to feed back if it failed right away.
    async fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::Connect => {
                let args = self.args.clone();
                self.command = None;
                self.connecting = Some(async move { connection::connect(&args).await }.boxed_local());
                None
            }
            Action::Disconnect => {
                self.command = None;
                self.connecting = None;
                None
            }
            Action::Send(request) => {
                let Some(io) = &mut self.command else {
                    warn!(message = "no connection to send a request over", %request);
                    return Some(Event::ConnectionClosed);
                };
                match io.send(request).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(
                            message = "sending request failed, will reconnect",
                            error = (&e as &dyn std::error::Error)
                        );
                        self.command = None;
                        Some(Event::ConnectionClosed)
                    }
                }
            }
            Action::FetchDiscovery => {
                let discovery = self.discovery.clone();
                self.fetching = Some(async move { discovery.fetch().await }.boxed_local());
                None
            }
        }
    }
}

async fn next_frame(io: &mut Option<CommandIo>) -> Option<Result<Response, std::io::Error>> {
    match io {
        Some(io) => io.next().await,
        None => std::future::pending().await,
    }
}

async fn next_completion<T>(future: &mut Option<LocalBoxFuture<'static, T>>) -> T {
    match future {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

pub async fn run(
    mut bridge: Bridge<HomieRegistry>,
    args: connection::Args,
    mqtt: rumqttc::v5::AsyncClient,
    mut eventloop: rumqttc::v5::EventLoop,
    tick: Duration,
) -> Result<(), Error> {
    let discovery = Discovery::new(&args).map_err(Error::Discovery)?;
    let mut io = Io { args, discovery, command: None, connecting: None, fetching: None };
    let (mqtt_sender, mut mqtt_events) = tokio::sync::mpsc::unbounded_channel::<MqttEvent>();
    let _mqtt_poller = AbortOnDropHandle::new(tokio::spawn(async move {
        loop {
            let event = eventloop.poll().await;
            let failed = event.is_err();
            if mqtt_sender.send(event).is_err() {
                return;
            }
            if failed {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }));
    let mut mqtt_ready = false;
    let mut ticks = tokio::time::interval_at(Instant::now() + tick, tick);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut actions = VecDeque::from(bridge.start(Instant::now()));
    loop {
        while let Some(action) = actions.pop_front() {
            debug!(message = "executing", ?action);
            if let Some(event) = io.execute(action).await {
                actions.extend(bridge.handle_event(event, Instant::now()));
            }
        }
        let registry = bridge.registry_mut();
        if mqtt_ready && registry.needs_republish() {
            registry.publish_device(&mqtt).await.map_err(Error::PublishDevice)?;
        }
        for p in registry.take_publishes() {
            mqtt.homie_publish(p).await.map_err(Error::Publish)?;
        }

        let event = tokio::select! {
            _ = ticks.tick() => Event::TickElapsed,
            frame = next_frame(&mut io.command) => match frame {
                Some(Ok(response)) => Event::DataReceived(response),
                Some(Err(e)) => {
                    warn!(
                        message = "could not read from ebusd",
                        error = (&e as &dyn std::error::Error)
                    );
                    io.command = None;
                    Event::ConnectionClosed
                }
                None => {
                    info!("ebusd closed the connection");
                    io.command = None;
                    Event::ConnectionClosed
                }
            },
            connected = next_completion(&mut io.connecting) => {
                io.connecting = None;
                match connected {
                    Ok(framed) => {
                        io.command = Some(framed);
                        Event::ConnectionOpened
                    }
                    Err(e) => {
                        warn!(
                            message = "could not connect to ebusd",
                            error = (&e as &dyn std::error::Error)
                        );
                        Event::ConnectionFailed
                    }
                }
            },
            fetched = next_completion(&mut io.fetching) => {
                io.fetching = None;
                match fetched {
                    Ok(body) => Event::DiscoveryReceived(body),
                    Err(e) => {
                        warn!(
                            message = "discovery failed",
                            error = (&e as &dyn std::error::Error)
                        );
                        Event::DiscoveryFailed
                    }
                }
            },
            mqtt_event = mqtt_events.recv() => {
                let Some(mqtt_event) = mqtt_event else {
                    return Ok(());
                };
                match mqtt_event {
                    Ok(rumqttc::v5::Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to the MQTT broker");
                        mqtt_ready = true;
                        bridge
                            .registry_mut()
                            .publish_device(&mqtt)
                            .await
                            .map_err(Error::PublishDevice)?;
                        continue;
                    }
                    Ok(rumqttc::v5::Event::Incoming(Packet::Publish(publish))) => {
                        match bridge.registry().decode_set(&publish) {
                            Some(request) => Event::WriteRequested(request),
                            None => continue,
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        if mqtt_ready {
                            warn!(
                                message = "lost the MQTT connection, will reconnect",
                                error = (&e as &dyn std::error::Error)
                            );
                        }
                        mqtt_ready = false;
                        continue;
                    }
                }
            },
        };
        actions.extend(bridge.handle_event(event, Instant::now()));
    }
}
