//! HTTP transport of the configuration and event services.
//!
//! [`client::EngineApiClient`] implements the service traits on top of a
//! remote endpoint. [`server::run_relay_server`] exposes them, forwarding every
//! call to an upstream implementation.

pub mod client;
pub mod error;
pub mod server;

pub(crate) mod paths {
    pub const GET_CONSTRAINTS: &str = "/v1/config/constraints/get";
    pub const ADD_CONSTRAINT: &str = "/v1/config/constraints/add";
    pub const REMOVE_CONSTRAINT: &str = "/v1/config/constraints/remove";
    pub const GET_ACTIONS: &str = "/v1/config/actions/get";
    pub const ADD_ACTION: &str = "/v1/config/actions/add";
    pub const REMOVE_ACTION: &str = "/v1/config/actions/remove";
    pub const INGEST_EVENT: &str = "/v1/events/ingest";
    pub const GET_EVENTS: &str = "/v1/events/get";
}
