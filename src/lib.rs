#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]
#![doc = include_str!("../README.md")]

pub mod error;
pub mod model;
pub mod protocol;
#[cfg(feature = "server")]
pub mod task;
pub mod transport;

pub use error::ServiceError;
pub use protocol::{serve, Peer, Plugin, PluginHost, ProtocolOptions, RequestOptions};
pub use transport::Transport;
