//! Client side of the KhanaSathi realtime channel: a reconnecting socket
//! manager that remembers its rooms, plus a small REST client and an order
//! status poller for when the socket is down.

pub mod connection;
pub mod error;
pub mod policy;
pub mod poller;
pub mod rest;
pub mod subscription;
pub mod tracker;

pub use connection::{ClientConfig, ConnectionState, RealtimeClient};
pub use error::ClientError;
pub use policy::ReconnectPolicy;
pub use poller::OrderPoller;
pub use rest::ApiClient;
pub use subscription::{EventFilter, Subscribers, Subscription};
pub use tracker::RoomTracker;
