//! Bridges the messages of an [ebusd](https://github.com/john30/ebusd) daemon to a Homie v5
//! device over MQTT.
pub mod bridge;
pub mod catalog;
pub mod commands;
pub mod connection;
pub mod ebusd;
pub mod fields;
pub mod homie;
pub mod output;
pub mod registry;
pub mod schema;
pub mod selection;
pub mod service;
pub mod value;
