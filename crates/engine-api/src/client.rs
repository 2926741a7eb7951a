use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Buf, Bytes};
use hyper::{Method, Request, Uri};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use serde::{Serialize, de::DeserializeOwned};
use vigil_core::service::*;

use crate::{error::EngineClientError, paths};

/// Client of a configuration/event endpoint: the cluster relay for node
/// agents, the central server for the relay.
#[derive(Debug, Clone)]
pub struct EngineApiClient {
    base_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl EngineApiClient {
    pub fn new(base_url: &str) -> Result<Self, EngineClientError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        // reject malformed urls upfront
        base_url.parse::<Uri>()?;

        Ok(Self {
            base_url,
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Open and close a TCP connection to the endpoint.
    pub async fn check_connection(&self, timeout: Duration) -> Result<(), EngineClientError> {
        let uri: Uri = self.base_url.parse()?;
        let host = uri.host().unwrap_or("localhost").to_string();
        let port = uri.port_u16().unwrap_or(80);
        let address = format!("{host}:{port}");

        let connect = tokio::net::TcpStream::connect(address.as_str());
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(source)) => Err(EngineClientError::Connect { address, source }),
            Err(_) => Err(EngineClientError::Connect {
                address,
                source: std::io::ErrorKind::TimedOut.into(),
            }),
        }
    }

    fn uri(&self, path: &str) -> Result<Uri, EngineClientError> {
        Ok(format!("{}{}", self.base_url, path).parse()?)
    }

    pub(crate) async fn post<Req, Res>(&self, path: &str, request: &Req) -> Result<Res, EngineClientError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(self.uri(path)?)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(EngineClientError::RequestBuilderError)?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(EngineClientError::HyperError)?;

        let status = res.status();
        let body = res
            .collect()
            .await
            .map_err(EngineClientError::CollectResponseError)?;

        if status.is_success() {
            Ok(serde_json::from_reader(body.aggregate().reader())?)
        } else {
            let error = body.to_bytes();
            Err(EngineClientError::UnexpectedResponse {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&error).into_owned(),
            })
        }
    }
}

impl ConfigService for EngineApiClient {
    async fn get_constraints(
        &self,
        request: GetConstraintsRequest,
    ) -> Result<GetConstraintsResponse, ServiceError> {
        Ok(self.post(paths::GET_CONSTRAINTS, &request).await?)
    }

    async fn add_constraint(
        &self,
        request: AddConstraintRequest,
    ) -> Result<AddConstraintResponse, ServiceError> {
        Ok(self.post(paths::ADD_CONSTRAINT, &request).await?)
    }

    async fn remove_constraint(
        &self,
        request: RemoveConstraintRequest,
    ) -> Result<RemoveConstraintResponse, ServiceError> {
        Ok(self.post(paths::REMOVE_CONSTRAINT, &request).await?)
    }

    async fn get_actions(
        &self,
        request: GetActionsRequest,
    ) -> Result<GetActionsResponse, ServiceError> {
        Ok(self.post(paths::GET_ACTIONS, &request).await?)
    }

    async fn add_action(&self, request: AddActionRequest) -> Result<AddActionResponse, ServiceError> {
        Ok(self.post(paths::ADD_ACTION, &request).await?)
    }

    async fn remove_action(
        &self,
        request: RemoveActionRequest,
    ) -> Result<RemoveActionResponse, ServiceError> {
        Ok(self.post(paths::REMOVE_ACTION, &request).await?)
    }
}

impl EventService for EngineApiClient {
    async fn ingest_event(
        &self,
        request: IngestEventRequest,
    ) -> Result<IngestEventResponse, ServiceError> {
        Ok(self.post(paths::INGEST_EVENT, &request).await?)
    }

    async fn get_events(&self, request: GetEventsRequest) -> Result<GetEventsResponse, ServiceError> {
        Ok(self.post(paths::GET_EVENTS, &request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_urls() {
        assert!(EngineApiClient::new("http://relay:8088/").is_ok());
        assert!(EngineApiClient::new("http://re lay").is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let client = EngineApiClient::new(&format!("http://{address}")).unwrap();
        assert!(
            client
                .check_connection(Duration::from_secs(1))
                .await
                .is_err()
        );
        let result = client.get_constraints(GetConstraintsRequest::default()).await;
        assert!(matches!(result, Err(ServiceError::Unavailable(_))));
    }
}
