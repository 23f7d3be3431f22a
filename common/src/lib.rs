pub mod attributes;
pub mod behaviors;
pub mod config;
pub mod device;
pub mod discovery;
pub mod dispatch;
pub mod http;
pub mod io;
pub mod ip_check;
pub mod keys;
pub mod net;
pub mod parameters;
pub mod properties;
pub mod server;
pub mod subscriptions;
pub mod types;

#[cfg(test)]
mod testing;

pub use attributes::{AttributeStore, ParseError};
pub use behaviors::{Dimmer, PressKind, Relay, Sensor, Tracker};
pub use config::{DeviceConfig, DeviceKind, NetworkConfig, NodeConfig, ServerConfig};
pub use device::{Behavior, Device, DeviceCore, Passive};
pub use dispatch::{Request, Response, Route};
pub use http::{HttpClientEngine, HttpClientError, HttpRequest, Method};
pub use io::{EdgeCounter, InputPin, OutputPin, PwmOutput};
pub use net::{Connection, Connector, DatagramSocket, Transport};
pub use parameters::Parameters;
pub use properties::{Properties, PropertiesError, PropertyStore, StoreError};
pub use server::{Delivery, NetworkInfo, Server, FRAMEWORK};
pub use subscriptions::{Subscription, SubscriptionRegistry};
pub use types::{DeviceType, SwitchState};
