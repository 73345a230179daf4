//! Callback mediation service.
//!
//! Lets TCP-style clients reach services running behind NAT or firewalls: an
//! agent on the private side dials out to the server over a websocket and
//! registers under a callback id, and the server multiplexes independent
//! client byte streams back over that single connection.

pub mod api;
pub mod carrier;
pub mod cli;
pub mod connman;
pub mod events;
pub mod mux;
pub mod proxy;
