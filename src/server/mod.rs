//! Messaging server - WebSocket admission, authentication and broadcast

mod auth;
mod connection;
mod listener;

pub use auth::{
    auth_manager_from_name, AuthManager, NoopAuthManager, TokenAuthManager, AUTH_MANAGERS,
    TOKEN_SUBPROTOCOL_PREFIX,
};
pub use connection::{WsClient, CLIENT_BUFFER};
pub use listener::{
    Admission, InboundMessage, MessagingServer, DEFAULT_MAX_CONNECTIONS, MAX_CONNECTIONS,
    MIN_CONNECTIONS,
};
