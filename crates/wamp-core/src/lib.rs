//! wamp-core: Shared protocol library for the WAMP client channel.
//!
//! Provides WAMP-CRA credential derivation and challenge responses, the
//! error taxonomy, opaque messages, deferred results, and the abstract
//! transport/handler/backend contracts that concrete transports implement.

pub mod auth;
pub mod deferred;
pub mod error;
pub mod message;
pub mod transport;

// Re-export commonly used items at crate root.
pub use auth::{
    compute_response, decode_base64, derive_key, encode_base64, generate_secret, verify_response,
    DerivationParams, DEFAULT_SECRET_LEN,
};
pub use deferred::{deferred, Deferred, Resolver};
pub use error::{WampError, WampResult};
pub use message::Message;
pub use transport::{
    ConnectionState, Connector, FlowHandler, FrameSink, FrameSource, Link, Transport,
    TransportHandler,
};
