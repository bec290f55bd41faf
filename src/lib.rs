//! mqtt-reactor - Reactive MQTT client session engine
//!
//! A backpressure-aware MQTT client built around an explicit credit
//! protocol: consumers request messages, and the engine acknowledges
//! inbound QoS>0 traffic only as messages are actually delivered
//! downstream, so a slow consumer throttles the broker through the
//! receive quota.
//!
//! # Overview
//!
//! - Streaming frame codec for the control-packet wire format
//! - Connection manager with keep-alive and reconnect (exponential
//!   backoff with jitter; terminal broker rejections stop retrying)
//! - Session state machine tracking QoS 1/2 acknowledgment handshakes,
//!   with duplicate-safe resumption after reconnect
//! - Flow-controlled dispatcher matching `+`/`#` topic filters and
//!   fanning out to demand-driven subscription flows
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_reactor::{ClientConfig, MqttClient, QoS};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("mqtt://localhost:1883");
//!     let client = MqttClient::connect(config).await?;
//!
//!     // Demand-driven consumption: request before you receive.
//!     let mut flow = client.subscribe("sensors/+/temperature", QoS::AtLeastOnce).await?;
//!     flow.request(10);
//!     while let Some(message) = flow.recv().await {
//!         println!("{}: {:?}", message.topic, message.payload);
//!         flow.request(1);
//!     }
//!
//!     client.publish("sensors/kitchen/temperature", "21.5", QoS::AtLeastOnce).await?;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod reactive;
pub mod session;
pub mod testing;

pub use client::MqttClient;
pub use codec::{ConnectReturnCode, ControlPacket, QoS, SubAckCode};
pub use config::{ClientConfig, LastWillConfig, ReconnectConfig};
pub use connection::{Connector, HealthSnapshot, TcpConnector};
pub use dispatch::{Message, TopicFilter};
pub use error::{MqttError, MqttResult};
pub use reactive::{MessageFlow, PublishCompletion, PublishSink};
pub use session::SessionState;
