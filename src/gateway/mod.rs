//! Request dispatch and the HTTP surfaces around it.

pub mod forwarder;
pub mod server;

pub use forwarder::Gateway;
pub use server::{create_admin_app, create_gateway_app, GatewayServer, ServerState};
