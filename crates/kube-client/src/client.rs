use std::path::PathBuf;

use bytes::BytesMut;
use reqwest::{Certificate, Method, RequestBuilder, Response, StatusCode};

use crate::{
    KubeConfig, KubeError, PodApi,
    types::{Pod, PodList, Status, WatchEvent},
};

/// Pod client for the api server.
#[derive(Debug, Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    api_server: String,
    token_file: Option<PathBuf>,
}

impl KubeClient {
    pub fn new(config: &KubeConfig) -> Result<Self, KubeError> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file).map_err(|source| KubeError::ReadFile {
                path: ca_file.clone(),
                source,
            })?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        let api_server = reqwest::Url::parse(&config.api_server).map_err(|err| {
            KubeError::Config(format!("invalid api server url {}: {err}", config.api_server))
        })?;
        if !matches!(api_server.scheme(), "http" | "https") {
            return Err(KubeError::Config(format!(
                "unsupported api server scheme {}",
                api_server.scheme()
            )));
        }

        Ok(Self {
            http: builder.build()?,
            api_server: config.api_server.trim_end_matches('/').to_string(),
            token_file: config.token_file.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_server, path))
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, KubeError> {
        match &self.token_file {
            None => Ok(request),
            Some(token_file) => {
                let token = tokio::fs::read_to_string(token_file)
                    .await
                    .map_err(|source| KubeError::ReadFile {
                        path: token_file.clone(),
                        source,
                    })?;
                Ok(request.bearer_auth(token.trim()))
            }
        }
    }

    /// List every pod, optionally restricted by a field selector.
    pub async fn list_pods(&self, field_selector: Option<&str>) -> Result<PodList, KubeError> {
        let request = self.authorize(self.list_request(field_selector)).await?;
        let response = check_status(request.send().await?).await?;
        Ok(serde_json::from_slice(&response.bytes().await?)?)
    }

    fn list_request(&self, field_selector: Option<&str>) -> RequestBuilder {
        let request = self.request(Method::GET, "/api/v1/pods");
        match field_selector {
            Some(selector) => request.query(&[("fieldSelector", selector)]),
            None => request,
        }
    }

    /// Open a watch on pods, starting after `resource_version`.
    ///
    /// The api server closes the stream after `timeout_secs`.
    pub async fn watch_pods(
        &self,
        field_selector: Option<&str>,
        resource_version: &str,
        timeout_secs: u64,
    ) -> Result<WatchStream, KubeError> {
        let request = self
            .watch_request(field_selector, resource_version, timeout_secs)
            .await?;
        let response = check_status(request.send().await?).await?;
        Ok(WatchStream {
            response,
            lines: LineBuffer::default(),
        })
    }

    async fn watch_request(
        &self,
        field_selector: Option<&str>,
        resource_version: &str,
        timeout_secs: u64,
    ) -> Result<RequestBuilder, KubeError> {
        let timeout = timeout_secs.to_string();
        let request = self.list_request(field_selector).query(&[
            ("watch", "true"),
            ("allowWatchBookmarks", "true"),
            ("resourceVersion", resource_version),
            ("timeoutSeconds", timeout.as_str()),
        ]);
        self.authorize(request).await
    }
}

/// Path of a single pod.
///
/// Both parts end up in the request path: anything that isn't a valid object
/// name is refused instead of being resolved as a path.
fn pod_path(namespace: &str, name: &str) -> Result<String, KubeError> {
    if !is_dns_label(namespace) {
        return Err(KubeError::InvalidName {
            kind: "namespace",
            value: namespace.to_string(),
        });
    }
    if !is_dns_subdomain(name) {
        return Err(KubeError::InvalidName {
            kind: "pod name",
            value: name.to_string(),
        });
    }
    Ok(format!("/api/v1/namespaces/{namespace}/pods/{name}"))
}

fn is_label_part(part: &str) -> bool {
    !part.is_empty()
        && !part.starts_with('-')
        && !part.ends_with('-')
        && part
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// RFC 1123 label, the format of namespace names.
fn is_dns_label(value: &str) -> bool {
    value.len() <= 63 && is_label_part(value)
}

/// RFC 1123 subdomain, the format of pod names.
fn is_dns_subdomain(value: &str) -> bool {
    value.len() <= 253 && value.split('.').all(is_label_part)
}

impl PodApi for KubeClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, KubeError> {
        let path = pod_path(namespace, name)?;
        let request = self.authorize(self.request(Method::GET, &path)).await?;
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(not_found(namespace, name));
        }
        let response = check_status(response).await?;
        Ok(serde_json::from_slice(&response.bytes().await?)?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), KubeError> {
        let path = pod_path(namespace, name)?;
        let request = self.authorize(self.request(Method::DELETE, &path)).await?;
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(not_found(namespace, name));
        }
        check_status(response).await?;
        Ok(())
    }
}

fn not_found(namespace: &str, name: &str) -> KubeError {
    KubeError::NotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

async fn check_status(response: Response) -> Result<Response, KubeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let message = match serde_json::from_slice::<Status>(&body) {
        Ok(status) => status.message,
        Err(_) => String::from_utf8_lossy(&body).into_owned(),
    };
    Err(KubeError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Newline-delimited watch events of an open watch request.
pub struct WatchStream {
    response: Response,
    lines: LineBuffer,
}

impl WatchStream {
    /// Next event, `None` once the api server ends the stream.
    pub async fn next(&mut self) -> Option<Result<WatchEvent, KubeError>> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Some(serde_json::from_slice(&line).map_err(KubeError::from));
            }
            match self.response.chunk().await {
                Ok(Some(chunk)) => self.lines.push(&chunk),
                Ok(None) => return None,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

/// Splits a byte stream into non-empty lines.
#[derive(Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<BytesMut> {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.iter().any(|b| !b.is_ascii_whitespace()) {
                return Some(line);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn client(api_server: &str) -> Result<KubeClient, KubeError> {
        KubeClient::new(&KubeConfig {
            api_server: api_server.to_string(),
            token_file: None,
            ca_file: None,
            resync_interval: Duration::from_secs(60),
        })
    }

    #[test]
    fn pod_paths() {
        assert_eq!(
            pod_path("default", "nginx-7c5ddbdf54-x2x8k").unwrap(),
            "/api/v1/namespaces/default/pods/nginx-7c5ddbdf54-x2x8k"
        );
        assert!(pod_path("default", "web.v2").is_ok());

        for (namespace, name) in [
            ("default", "../../kube-system/pods/coredns"),
            ("default", ".."),
            ("default", "a/b"),
            ("default", ""),
            ("default", "Nginx"),
            ("default", "nginx?dryRun=All"),
            ("..", "nginx"),
            ("kube-system/pods/coredns#", "nginx"),
            ("my.namespace", "nginx"),
            ("", "nginx"),
        ] {
            assert!(
                matches!(
                    pod_path(namespace, name),
                    Err(KubeError::InvalidName { .. })
                ),
                "{namespace}/{name} accepted"
            );
        }
        assert!(pod_path(&"a".repeat(64), "nginx").is_err());
        assert!(pod_path("default", &"a".repeat(254)).is_err());
    }

    #[tokio::test]
    async fn traversing_names_never_reach_the_api_server() {
        // nothing listens there: an attempted request would fail as Http
        let client = client("http://127.0.0.1:9").unwrap();
        assert!(matches!(
            client
                .delete_pod("default", "../../kube-system/pods/coredns")
                .await,
            Err(KubeError::InvalidName { kind: "pod name", .. })
        ));
        assert!(matches!(
            client.get_pod("default/../kube-system", "coredns").await,
            Err(KubeError::InvalidName { kind: "namespace", .. })
        ));
    }

    #[test]
    fn invalid_api_server() {
        assert!(matches!(client("10.96.0.1:443"), Err(KubeError::Config(_))));
        assert!(matches!(
            client("ftp://10.96.0.1"),
            Err(KubeError::Config(_))
        ));
        assert!(client("https://[fd00::1]:443/").is_ok());
    }

    #[tokio::test]
    async fn watch_query_carries_the_node_selector() {
        let client = client("https://10.96.0.1:443").unwrap();
        let request = client
            .watch_request(Some("spec.nodeName=worker-1"), "4242", 290)
            .await
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(request.url().path(), "/api/v1/pods");
        let query: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        for expected in [
            ("fieldSelector", "spec.nodeName=worker-1"),
            ("watch", "true"),
            ("resourceVersion", "4242"),
            ("timeoutSeconds", "290"),
        ] {
            assert!(
                query
                    .iter()
                    .any(|(key, value)| key == expected.0 && value == expected.1),
                "missing {expected:?} in {query:?}"
            );
        }
    }

    #[test]
    fn unscoped_list_has_no_selector() {
        let client = client("https://10.96.0.1:443").unwrap();
        let request = client.list_request(None).build().unwrap();
        assert_eq!(request.url().query(), None);

        let request = client
            .list_request(Some("spec.nodeName=worker-1"))
            .build()
            .unwrap();
        assert_eq!(
            request.url().query(),
            Some("fieldSelector=spec.nodeName%3Dworker-1")
        );
    }

    #[test]
    fn lines_split_across_chunks() {
        let mut lines = LineBuffer::default();
        lines.push(b"{\"a\":");
        assert!(lines.next_line().is_none());
        lines.push(b"1}\n\n{\"b\":2}\n{\"c\"");
        assert_eq!(&lines.next_line().unwrap()[..], b"{\"a\":1}");
        assert_eq!(&lines.next_line().unwrap()[..], b"{\"b\":2}");
        assert!(lines.next_line().is_none());
        assert_eq!(lines.buf.len(), 4);
    }
}
