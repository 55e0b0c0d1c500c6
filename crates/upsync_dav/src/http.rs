use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Client, Method, RequestBuilder, Url};
use tracing::debug;

use crate::bridge::{
    normalize_etag, ChunkPut, DavBridge, DavError, DavMethod, DavResponse, FilePut, NamespaceMove,
    RemoteFile,
};
use crate::{OC_MTIME_HEADER, OC_TOTAL_LENGTH_HEADER};

/// Server location and the account the requests run as.
#[derive(Debug, Clone)]
pub struct DavEndpoint {
    pub base_url: String,
    pub username: String,
    pub password: Option<String>,
}

impl DavEndpoint {
    fn base(&self) -> Result<Url, DavError> {
        Url::parse(&self.base_url)
            .map_err(|e| DavError::InvalidRequest(format!("invalid base url {}: {e}", self.base_url)))
    }

    pub fn uploads_root(&self) -> Result<Url, DavError> {
        join(self.base()?, &["remote.php", "dav", "uploads", &self.username])
    }

    pub fn files_root(&self, space_id: Option<&str>) -> Result<Url, DavError> {
        match space_id {
            Some(space) => join(self.base()?, &["remote.php", "dav", "spaces", space]),
            None => join(self.base()?, &["remote.php", "dav", "files", &self.username]),
        }
    }

    pub fn namespace_url(&self, transfer_id: &str) -> Result<Url, DavError> {
        join(self.uploads_root()?, &[transfer_id])
    }

    pub fn chunk_url(&self, transfer_id: &str, index: u64) -> Result<Url, DavError> {
        join(self.uploads_root()?, &[transfer_id, &index.to_string()])
    }

    pub fn file_url(&self, remote_path: &str, space_id: Option<&str>) -> Result<Url, DavError> {
        let segments: Vec<&str> = remote_path.split('/').filter(|s| !s.is_empty()).collect();
        join(self.files_root(space_id)?, &segments)
    }
}

fn join(mut url: Url, segments: &[&str]) -> Result<Url, DavError> {
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| DavError::InvalidRequest("base url cannot carry a path".to_string()))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// WebDAV client. Every request carries a timeout: the bridge-wide
/// `request_timeout` unless the call supplies its own.
#[derive(Debug, Clone)]
pub struct HttpDavBridge {
    client: Client,
    endpoint: DavEndpoint,
    request_timeout: Duration,
}

impl HttpDavBridge {
    pub fn new(endpoint: DavEndpoint, connect_timeout: Duration) -> Result<Self, DavError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| DavError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn endpoint(&self) -> &DavEndpoint {
        &self.endpoint
    }

    fn request(&self, method: DavMethod, url: Url) -> Result<RequestBuilder, DavError> {
        let builder = self
            .client
            .request(to_http_method(method)?, url)
            .timeout(self.request_timeout);
        Ok(match &self.endpoint.password {
            Some(password) => builder.basic_auth(&self.endpoint.username, Some(password)),
            None => builder,
        })
    }

    async fn send(
        &self,
        method: DavMethod,
        target: &Url,
        builder: RequestBuilder,
    ) -> Result<DavResponse, DavError> {
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .and_then(normalize_etag);
        debug!(method = %method, target = %target, status, "dav response");
        Ok(DavResponse {
            method,
            target: target.to_string(),
            status,
            etag,
        })
    }
}

#[async_trait]
impl DavBridge for HttpDavBridge {
    async fn create_namespace(&self, transfer_id: &str) -> Result<DavResponse, DavError> {
        let url = self.endpoint.namespace_url(transfer_id)?;
        let builder = self.request(DavMethod::Mkcol, url.clone())?;
        self.send(DavMethod::Mkcol, &url, builder).await
    }

    async fn put_chunk(&self, request: ChunkPut) -> Result<DavResponse, DavError> {
        let url = self.endpoint.chunk_url(&request.transfer_id, request.index)?;
        let builder = self
            .request(DavMethod::Put, url.clone())?
            .timeout(request.timeout)
            .header(CONTENT_TYPE, request.content_type)
            .body(request.body);
        self.send(DavMethod::Put, &url, builder).await
    }

    async fn move_namespace(&self, request: NamespaceMove) -> Result<DavResponse, DavError> {
        let source = self.endpoint.namespace_url(&request.transfer_id)?;
        let destination = self
            .endpoint
            .file_url(&request.destination, request.space_id.as_deref())?;
        let mut builder = self
            .request(DavMethod::Move, source.clone())?
            .timeout(request.timeout)
            .header("Destination", destination.as_str())
            .header("Overwrite", if request.overwrite { "T" } else { "F" })
            .header(OC_TOTAL_LENGTH_HEADER, request.total_length.to_string())
            .header(OC_MTIME_HEADER, request.mtime_secs.to_string());
        if let Some(etag) = request.if_match {
            builder = builder.header(IF_MATCH, etag);
        }
        self.send(DavMethod::Move, &source, builder).await
    }

    async fn delete_namespace(&self, transfer_id: &str) -> Result<DavResponse, DavError> {
        let url = self.endpoint.namespace_url(transfer_id)?;
        let builder = self.request(DavMethod::Delete, url.clone())?;
        self.send(DavMethod::Delete, &url, builder).await
    }

    async fn put_file(&self, request: FilePut) -> Result<DavResponse, DavError> {
        let url = self
            .endpoint
            .file_url(&request.remote_path, request.space_id.as_deref())?;
        let total_length = request.body.len();
        let mut builder = self
            .request(DavMethod::Put, url.clone())?
            .timeout(request.timeout)
            .header(CONTENT_TYPE, request.content_type)
            .header(OC_TOTAL_LENGTH_HEADER, total_length.to_string())
            .header(OC_MTIME_HEADER, request.mtime_secs.to_string())
            .body(request.body);
        if let Some(etag) = request.if_match {
            builder = builder.header(IF_MATCH, etag);
        }
        if request.create_only {
            builder = builder.header(IF_NONE_MATCH, "*");
        }
        self.send(DavMethod::Put, &url, builder).await
    }

    async fn create_folder(
        &self,
        remote_path: &str,
        space_id: Option<&str>,
    ) -> Result<DavResponse, DavError> {
        let url = self.endpoint.file_url(remote_path, space_id)?;
        let builder = self.request(DavMethod::Mkcol, url.clone())?;
        self.send(DavMethod::Mkcol, &url, builder).await
    }

    async fn lookup(
        &self,
        remote_path: &str,
        space_id: Option<&str>,
    ) -> Result<Option<RemoteFile>, DavError> {
        let url = self.endpoint.file_url(remote_path, space_id)?;
        let response = self
            .request(DavMethod::Head, url.clone())?
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        match status {
            404 => Ok(None),
            200..=299 => {
                let headers = response.headers();
                Ok(Some(RemoteFile {
                    length: headers
                        .get(CONTENT_LENGTH)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.parse().ok())
                        .unwrap_or(0),
                    etag: headers
                        .get(ETAG)
                        .and_then(|value| value.to_str().ok())
                        .and_then(normalize_etag),
                }))
            }
            other => Err(DavError::Request(format!("HEAD {url} returned {other}"))),
        }
    }
}

fn to_http_method(method: DavMethod) -> Result<Method, DavError> {
    match method {
        DavMethod::Put => Ok(Method::PUT),
        DavMethod::Head => Ok(Method::HEAD),
        DavMethod::Delete => Ok(Method::DELETE),
        DavMethod::Move | DavMethod::Mkcol => Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| DavError::InvalidRequest(e.to_string())),
    }
}

fn map_reqwest_error(error: reqwest::Error) -> DavError {
    if error.is_timeout() {
        DavError::Timeout(error.to_string())
    } else if error.is_connect() {
        DavError::Connection(error.to_string())
    } else if error.is_builder() {
        DavError::InvalidRequest(error.to_string())
    } else {
        DavError::Request(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bridge_for(server: &MockServer) -> HttpDavBridge {
        HttpDavBridge::new(
            DavEndpoint {
                base_url: server.uri(),
                username: "alice".to_string(),
                password: Some("secret".to_string()),
            },
            Duration::from_secs(5),
        )
        .expect("bridge")
    }

    #[test]
    fn urls_are_percent_encoded() {
        let endpoint = DavEndpoint {
            base_url: "https://cloud.example.com/".to_string(),
            username: "alice".to_string(),
            password: None,
        };
        assert_eq!(
            endpoint.chunk_url("tx-1", 3).expect("url").as_str(),
            "https://cloud.example.com/remote.php/dav/uploads/alice/tx-1/3"
        );
        assert_eq!(
            endpoint
                .file_url("/Photos/summer trip.jpg", None)
                .expect("url")
                .as_str(),
            "https://cloud.example.com/remote.php/dav/files/alice/Photos/summer%20trip.jpg"
        );
        assert_eq!(
            endpoint.file_url("/a.txt", Some("space-9")).expect("url").as_str(),
            "https://cloud.example.com/remote.php/dav/spaces/space-9/a.txt"
        );
    }

    #[tokio::test]
    async fn put_chunk_targets_numbered_resource() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/remote.php/dav/uploads/alice/tx-1/0"))
            .and(header("content-type", "image/jpeg"))
            .and(header_exists("authorization"))
            .and(body_bytes(b"abcd".to_vec()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let response = bridge_for(&server)
            .put_chunk(ChunkPut {
                transfer_id: "tx-1".to_string(),
                index: 0,
                body: b"abcd".to_vec(),
                content_type: "image/jpeg".to_string(),
                timeout: Duration::from_secs(5),
            })
            .await
            .expect("response");

        assert!(response.is_success());
        assert_eq!(response.method, DavMethod::Put);
    }

    #[tokio::test]
    async fn move_carries_length_and_mtime_headers() {
        let server = MockServer::start().await;
        Mock::given(method("MOVE"))
            .and(path("/remote.php/dav/uploads/alice/tx-2"))
            .and(header("overwrite", "F"))
            .and(header("oc-total-length", "20971520"))
            .and(header("x-oc-mtime", "1700000000"))
            .and(header_exists("destination"))
            .respond_with(ResponseTemplate::new(412))
            .expect(1)
            .mount(&server)
            .await;

        let response = bridge_for(&server)
            .move_namespace(NamespaceMove {
                transfer_id: "tx-2".to_string(),
                destination: "/Docs/big.bin".to_string(),
                space_id: None,
                overwrite: false,
                mtime_secs: 1_700_000_000,
                total_length: 20_971_520,
                if_match: None,
                timeout: Duration::from_secs(5),
            })
            .await
            .expect("response");

        assert_eq!(response.status, 412);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn mkcol_creates_namespace() {
        let server = MockServer::start().await;
        Mock::given(method("MKCOL"))
            .and(path("/remote.php/dav/uploads/alice/tx-3"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let response = bridge_for(&server)
            .create_namespace("tx-3")
            .await
            .expect("response");
        assert_eq!(response.status, 201);
    }

    #[tokio::test]
    async fn put_file_reports_unquoted_etag() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/remote.php/dav/files/alice/notes.txt"))
            .and(header("if-match", "old-etag"))
            .and(header("oc-total-length", "5"))
            .respond_with(ResponseTemplate::new(204).insert_header("etag", "\"new-etag\""))
            .mount(&server)
            .await;

        let response = bridge_for(&server)
            .put_file(FilePut {
                remote_path: "/notes.txt".to_string(),
                space_id: None,
                body: b"hello".to_vec(),
                content_type: "text/plain".to_string(),
                if_match: Some("old-etag".to_string()),
                create_only: false,
                mtime_secs: 1,
                timeout: Duration::from_secs(5),
            })
            .await
            .expect("response");

        assert_eq!(response.etag.as_deref(), Some("new-etag"));
    }

    #[tokio::test]
    async fn create_only_put_sends_if_none_match() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/remote.php/dav/files/alice/new.txt"))
            .and(header("if-none-match", "*"))
            .respond_with(ResponseTemplate::new(412))
            .expect(1)
            .mount(&server)
            .await;

        let response = bridge_for(&server)
            .put_file(FilePut {
                remote_path: "/new.txt".to_string(),
                space_id: None,
                body: b"hello".to_vec(),
                content_type: "text/plain".to_string(),
                if_match: None,
                create_only: true,
                mtime_secs: 1,
                timeout: Duration::from_secs(5),
            })
            .await
            .expect("response");

        assert_eq!(response.status, 412);
    }

    #[tokio::test]
    async fn folder_and_namespace_cleanup_requests() {
        let server = MockServer::start().await;
        Mock::given(method("MKCOL"))
            .and(path("/remote.php/dav/files/alice/Photos/2024"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/remote.php/dav/uploads/alice/tx-9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let bridge = bridge_for(&server);
        let created = bridge
            .create_folder("/Photos/2024", None)
            .await
            .expect("mkcol");
        let deleted = bridge.delete_namespace("tx-9").await.expect("delete");

        assert_eq!(created.status, 201);
        assert_eq!(deleted.status, 204);
    }

    #[tokio::test]
    async fn stalled_server_times_out_metadata_requests() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
        Mock::given(method("MKCOL"))
            .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
        let bridge = bridge_for(&server).with_request_timeout(Duration::from_millis(200));

        let looked_up = tokio::time::timeout(Duration::from_secs(5), bridge.lookup("/slow.bin", None))
            .await
            .expect("HEAD bounded by the request timeout");
        let created = tokio::time::timeout(Duration::from_secs(5), bridge.create_namespace("tx"))
            .await
            .expect("MKCOL bounded by the request timeout");

        assert!(matches!(looked_up, Err(DavError::Timeout(_))), "got {looked_up:?}");
        assert!(matches!(created, Err(DavError::Timeout(_))), "got {created:?}");
    }

    #[tokio::test]
    async fn head_distinguishes_missing_files() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/remote.php/dav/files/alice/present.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "42")
                    .insert_header("etag", "\"e-1\""),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/remote.php/dav/files/alice/missing.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let bridge = bridge_for(&server);
        let present = bridge.lookup("/present.bin", None).await.expect("head").expect("file");
        assert_eq!(present.etag.as_deref(), Some("e-1"));
        assert!(bridge.lookup("/missing.bin", None).await.expect("head").is_none());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let bridge = HttpDavBridge::new(
            DavEndpoint {
                base_url: "http://127.0.0.1:1".to_string(),
                username: "alice".to_string(),
                password: None,
            },
            Duration::from_secs(2),
        )
        .expect("bridge");

        let err = bridge.create_namespace("tx").await.unwrap_err();
        assert!(matches!(err, DavError::Connection(_)), "got {err:?}");
    }
}
