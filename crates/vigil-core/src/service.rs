//! Configuration and event service contracts.
//!
//! The same contracts are served by the central server and by the cluster relay,
//! and consumed by node agents, the relay itself and the enforcement engine.

use std::{future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Action, Constraint, Event, MatchLabel};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetConstraintsRequest {
    pub namespace: Option<String>,
    pub labels: Vec<MatchLabel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetConstraintsResponse {
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddConstraintRequest {
    pub constraint: Constraint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddConstraintResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveConstraintRequest {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveConstraintResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetActionsRequest {
    pub namespace: Option<String>,
    pub labels: Vec<MatchLabel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetActionsResponse {
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddActionRequest {
    pub action: Action,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddActionResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveActionRequest {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveActionResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestEventRequest {
    pub event: Event,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestEventResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetEventsRequest {
    pub namespace: Option<String>,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetEventsResponse {
    pub events: Vec<Event>,
}

/// Failure of a service call, independent of the transport carrying it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub trait ConfigService: Send + Sync {
    fn get_constraints(
        &self,
        request: GetConstraintsRequest,
    ) -> impl Future<Output = Result<GetConstraintsResponse, ServiceError>> + Send;

    fn add_constraint(
        &self,
        request: AddConstraintRequest,
    ) -> impl Future<Output = Result<AddConstraintResponse, ServiceError>> + Send;

    fn remove_constraint(
        &self,
        request: RemoveConstraintRequest,
    ) -> impl Future<Output = Result<RemoveConstraintResponse, ServiceError>> + Send;

    fn get_actions(
        &self,
        request: GetActionsRequest,
    ) -> impl Future<Output = Result<GetActionsResponse, ServiceError>> + Send;

    fn add_action(
        &self,
        request: AddActionRequest,
    ) -> impl Future<Output = Result<AddActionResponse, ServiceError>> + Send;

    fn remove_action(
        &self,
        request: RemoveActionRequest,
    ) -> impl Future<Output = Result<RemoveActionResponse, ServiceError>> + Send;
}

pub trait EventService: Send + Sync {
    fn ingest_event(
        &self,
        request: IngestEventRequest,
    ) -> impl Future<Output = Result<IngestEventResponse, ServiceError>> + Send;

    fn get_events(
        &self,
        request: GetEventsRequest,
    ) -> impl Future<Output = Result<GetEventsResponse, ServiceError>> + Send;
}

impl<T: ConfigService> ConfigService for Arc<T> {
    fn get_constraints(
        &self,
        request: GetConstraintsRequest,
    ) -> impl Future<Output = Result<GetConstraintsResponse, ServiceError>> + Send {
        (**self).get_constraints(request)
    }

    fn add_constraint(
        &self,
        request: AddConstraintRequest,
    ) -> impl Future<Output = Result<AddConstraintResponse, ServiceError>> + Send {
        (**self).add_constraint(request)
    }

    fn remove_constraint(
        &self,
        request: RemoveConstraintRequest,
    ) -> impl Future<Output = Result<RemoveConstraintResponse, ServiceError>> + Send {
        (**self).remove_constraint(request)
    }

    fn get_actions(
        &self,
        request: GetActionsRequest,
    ) -> impl Future<Output = Result<GetActionsResponse, ServiceError>> + Send {
        (**self).get_actions(request)
    }

    fn add_action(
        &self,
        request: AddActionRequest,
    ) -> impl Future<Output = Result<AddActionResponse, ServiceError>> + Send {
        (**self).add_action(request)
    }

    fn remove_action(
        &self,
        request: RemoveActionRequest,
    ) -> impl Future<Output = Result<RemoveActionResponse, ServiceError>> + Send {
        (**self).remove_action(request)
    }
}

impl<T: EventService> EventService for Arc<T> {
    fn ingest_event(
        &self,
        request: IngestEventRequest,
    ) -> impl Future<Output = Result<IngestEventResponse, ServiceError>> + Send {
        (**self).ingest_event(request)
    }

    fn get_events(
        &self,
        request: GetEventsRequest,
    ) -> impl Future<Output = Result<GetEventsResponse, ServiceError>> + Send {
        (**self).get_events(request)
    }
}

/// Bound a service call. Expiry maps to [`ServiceError::DeadlineExceeded`].
pub async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, ServiceError>>,
) -> Result<T, ServiceError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ServiceError::DeadlineExceeded(timeout))?
}
