//! Cluster relay: the configuration and event endpoints served to node agents.
//!
//! Calls are forwarded upstream with a deadline. Constraint mutations are
//! refused unless explicitly enabled, action mutations always: actions are
//! administered on the central server.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::post,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use vigil_core::{
    model::Event,
    pdk::ModuleName,
    service::{self, *},
};

use crate::{error::EngineApiError, paths};

/// Deadline of every forwarded call.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Implementation the relay forwards to.
pub trait Upstream: ConfigService + EventService + 'static {}

impl<T: ConfigService + EventService + 'static> Upstream for T {}

pub struct RelayContext<S> {
    pub name: ModuleName,
    pub upstream: S,
    pub enable_add_constraint: bool,
    /// Ingested events are also handed to the local enforcement engine.
    pub event_queue: Option<mpsc::Sender<Event>>,
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    tx_shutdown: oneshot::Sender<()>,
    server_join_handle: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        drop(self.tx_shutdown);
        let _ = self.server_join_handle.await;
    }
}

pub async fn run_relay_server<S: Upstream>(
    address: SocketAddr,
    ctx: RelayContext<S>,
) -> Result<ServerHandle> {
    let name = ctx.name;
    let app = Router::new()
        .route(paths::GET_CONSTRAINTS, post(get_constraints::<S>))
        .route(paths::ADD_CONSTRAINT, post(add_constraint::<S>))
        .route(paths::REMOVE_CONSTRAINT, post(remove_constraint::<S>))
        .route(paths::GET_ACTIONS, post(get_actions::<S>))
        .route(paths::ADD_ACTION, post(add_action::<S>))
        .route(paths::REMOVE_ACTION, post(remove_action::<S>))
        .route(paths::INGEST_EVENT, post(ingest_event::<S>))
        .route(paths::GET_EVENTS, post(get_events::<S>))
        .with_state(Arc::new(ctx));

    serve(name, address, app).await
}

/// Serve `app` on `address` in a background task until the handle is stopped.
pub async fn serve(name: ModuleName, address: SocketAddr, app: Router) -> Result<ServerHandle> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Cannot bind to {address}"))?;
    let local_addr = listener.local_addr()?;
    log::info!(target: name, "listening on {local_addr}");

    let (tx_shutdown, rx_shutdown) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = rx_shutdown.await;
    });

    let server_join_handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!(target: name, "server error: {e}");
        }
    });

    Ok(ServerHandle {
        local_addr,
        tx_shutdown,
        server_join_handle,
    })
}

type Ctx<S> = State<Arc<RelayContext<S>>>;

async fn get_constraints<S: Upstream>(
    State(ctx): Ctx<S>,
    body: Result<Json<GetConstraintsRequest>, JsonRejection>,
) -> Result<Json<GetConstraintsResponse>, EngineApiError> {
    let Json(request) = body?;
    log::trace!(target: ctx.name, "received GetConstraints");
    let response =
        service::with_timeout(FORWARD_TIMEOUT, ctx.upstream.get_constraints(request)).await?;
    Ok(Json(response))
}

async fn add_constraint<S: Upstream>(
    State(ctx): Ctx<S>,
    body: Result<Json<AddConstraintRequest>, JsonRejection>,
) -> Result<Json<AddConstraintResponse>, EngineApiError> {
    if !ctx.enable_add_constraint {
        return Err(EngineApiError::NotImplemented(
            "AddConstraint is disabled in the cluster agent".to_string(),
        ));
    }
    let Json(request) = body?;
    let response =
        service::with_timeout(FORWARD_TIMEOUT, ctx.upstream.add_constraint(request)).await?;
    Ok(Json(response))
}

async fn remove_constraint<S: Upstream>(
    State(ctx): Ctx<S>,
    body: Result<Json<RemoveConstraintRequest>, JsonRejection>,
) -> Result<Json<RemoveConstraintResponse>, EngineApiError> {
    if !ctx.enable_add_constraint {
        return Err(EngineApiError::NotImplemented(
            "RemoveConstraint is not supported by the cluster agent, send it to the server"
                .to_string(),
        ));
    }
    let Json(request) = body?;
    let response =
        service::with_timeout(FORWARD_TIMEOUT, ctx.upstream.remove_constraint(request)).await?;
    Ok(Json(response))
}

async fn get_actions<S: Upstream>(
    State(ctx): Ctx<S>,
    body: Result<Json<GetActionsRequest>, JsonRejection>,
) -> Result<Json<GetActionsResponse>, EngineApiError> {
    let Json(request) = body?;
    let response =
        service::with_timeout(FORWARD_TIMEOUT, ctx.upstream.get_actions(request)).await?;
    Ok(Json(response))
}

async fn add_action<S: Upstream>(State(_ctx): Ctx<S>) -> Result<(), EngineApiError> {
    Err(EngineApiError::NotImplemented(
        "AddAction is not supported by the cluster agent, send it to the server".to_string(),
    ))
}

async fn remove_action<S: Upstream>(State(_ctx): Ctx<S>) -> Result<(), EngineApiError> {
    Err(EngineApiError::NotImplemented(
        "RemoveAction is not supported by the cluster agent, send it to the server".to_string(),
    ))
}

async fn ingest_event<S: Upstream>(
    State(ctx): Ctx<S>,
    body: Result<Json<IngestEventRequest>, JsonRejection>,
) -> Result<Json<IngestEventResponse>, EngineApiError> {
    let Json(request) = body?;
    log::trace!(target: ctx.name, "received IngestEvent");
    let event = request.event.clone();
    let response = service::with_timeout(FORWARD_TIMEOUT, ctx.upstream.ingest_event(request)).await;

    // the local engine sees the event even if the server didn't take it
    if let Some(queue) = &ctx.event_queue {
        if queue.send(event).await.is_err() {
            log::warn!(target: ctx.name, "action handler stopped, event not queued");
        }
    }

    Ok(Json(response?))
}

async fn get_events<S: Upstream>(
    State(ctx): Ctx<S>,
    body: Result<Json<GetEventsRequest>, JsonRejection>,
) -> Result<Json<GetEventsResponse>, EngineApiError> {
    let Json(request) = body?;
    let response = service::with_timeout(FORWARD_TIMEOUT, ctx.upstream.get_events(request)).await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use vigil_core::{
        model::{Constraint, EVENT_TYPE_VIOLATION, Pod, Target},
        test_utils::MemoryServer,
    };

    use super::*;
    use crate::client::EngineApiClient;

    async fn start(
        server: Arc<MemoryServer>,
        enable_add_constraint: bool,
        event_queue: Option<mpsc::Sender<Event>>,
    ) -> (ServerHandle, EngineApiClient) {
        let handle = run_relay_server(
            "127.0.0.1:0".parse().unwrap(),
            RelayContext {
                name: "relay-test",
                upstream: server,
                enable_add_constraint,
                event_queue,
            },
        )
        .await
        .unwrap();
        let client = EngineApiClient::new(&format!("http://{}", handle.local_addr())).unwrap();
        (handle, client)
    }

    fn violation() -> Event {
        Event::new(
            EVENT_TYPE_VIOLATION,
            Utc::now(),
            vec![Target {
                pod: Some(Pod {
                    uid: "u1".to_string(),
                    name: "nginx-1".to_string(),
                    namespace: "default".to_string(),
                    labels: vec![],
                }),
                ..Default::default()
            }],
        )
    }

    #[tokio::test]
    async fn constraints_are_forwarded() {
        let server = Arc::new(
            MemoryServer::new().with_constraints(vec![Constraint::new("default", "nginx")]),
        );
        let (handle, client) = start(server, false, None).await;

        let response = client
            .get_constraints(GetConstraintsRequest::default())
            .await
            .unwrap();
        assert_eq!(response.constraints.len(), 1);
        assert_eq!(response.constraints[0].name, "nginx");

        handle.stop().await;
    }

    #[tokio::test]
    async fn add_constraint_is_gated() {
        let server = Arc::new(MemoryServer::new());
        let (handle, client) = start(server.clone(), false, None).await;

        let result = client
            .add_constraint(AddConstraintRequest {
                constraint: Constraint::new("default", "registered"),
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Unimplemented(_))));
        assert!(server.constraints().is_empty());
        handle.stop().await;

        let (handle, client) = start(server.clone(), true, None).await;
        let response = client
            .add_constraint(AddConstraintRequest {
                constraint: Constraint::new("default", "registered"),
            })
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(server.constraints().len(), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn action_mutations_are_rejected() {
        let server = Arc::new(MemoryServer::new());
        let (handle, client) = start(server.clone(), true, None).await;

        let result = client
            .remove_action(RemoveActionRequest {
                namespace: "default".to_string(),
                name: "kill".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Unimplemented(_))));
        assert!(server.actions().is_empty());
        handle.stop().await;
    }

    #[tokio::test]
    async fn ingested_events_reach_the_queue() {
        let server = Arc::new(MemoryServer::new());
        let (tx, mut rx) = mpsc::channel(8);
        let (handle, client) = start(server.clone(), false, Some(tx)).await;

        let response = client
            .ingest_event(IngestEventRequest { event: violation() })
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(server.events().len(), 1);

        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.event_type, EVENT_TYPE_VIOLATION);
        handle.stop().await;
    }

    #[tokio::test]
    async fn upstream_failure_is_bad_gateway_but_still_queued() {
        let server = Arc::new(MemoryServer::new());
        server.set_unavailable(true);
        let (tx, mut rx) = mpsc::channel(8);
        let (handle, client) = start(server.clone(), false, Some(tx)).await;

        let result = client
            .ingest_event(IngestEventRequest { event: violation() })
            .await;
        assert!(matches!(result, Err(ServiceError::Unavailable(_))));
        assert!(rx.recv().await.is_some());
        handle.stop().await;
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let server = Arc::new(MemoryServer::new());
        let (handle, client) = start(server, false, None).await;

        // a remove request is not a valid ingest request
        let result: Result<IngestEventResponse, _> = client
            .post(
                paths::INGEST_EVENT,
                &RemoveActionRequest {
                    namespace: "default".to_string(),
                    name: "x".to_string(),
                },
            )
            .await;
        assert!(matches!(
            result.map_err(ServiceError::from),
            Err(ServiceError::InvalidArgument(_))
        ));
        handle.stop().await;
    }
}
