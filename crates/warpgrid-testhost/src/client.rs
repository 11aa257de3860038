//! Convenience client over [`ClientHandler`].

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, Uri, Version};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use warpgrid_exchange::{Error, Result};

use crate::body::ResponseBody;
use crate::content::RequestBody;
use crate::convert;
use crate::handler::ClientHandler;

/// Builds and sends requests against a test server, resolving relative
/// URIs against its base address.
#[derive(Debug, Clone)]
pub struct TestClient {
    handler: ClientHandler,
    base_address: Uri,
    default_headers: HeaderMap,
    version: Version,
}

impl TestClient {
    pub(crate) fn new(handler: ClientHandler, base_address: Uri) -> Self {
        Self {
            handler,
            base_address,
            default_headers: HeaderMap::new(),
            version: Version::HTTP_11,
        }
    }

    pub fn base_address(&self) -> &Uri {
        &self.base_address
    }

    /// Header sent with every request unless the request sets it itself.
    pub fn with_default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.append(name, value);
        self
    }

    /// Protocol version used for requests that do not set one.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn handler(&self) -> &ClientHandler {
        &self.handler
    }

    pub fn request(&self, method: Method, uri: &str) -> RequestBuilder<'_> {
        let uri = convert::resolve_uri(&self.base_address, uri);
        let mut request = Request::new(RequestBody::empty());
        *request.method_mut() = method;
        *request.version_mut() = self.version;
        *request.headers_mut() = self.default_headers.clone();
        RequestBuilder {
            client: self,
            request: uri.map(|uri| {
                *request.uri_mut() = uri;
                request
            }),
        }
    }

    pub fn get(&self, uri: &str) -> RequestBuilder<'_> {
        self.request(Method::GET, uri)
    }

    pub fn post(&self, uri: &str) -> RequestBuilder<'_> {
        self.request(Method::POST, uri)
    }

    pub fn put(&self, uri: &str) -> RequestBuilder<'_> {
        self.request(Method::PUT, uri)
    }

    pub fn delete(&self, uri: &str) -> RequestBuilder<'_> {
        self.request(Method::DELETE, uri)
    }

    /// Send a fully built request message.
    pub async fn send(&self, request: &Request<RequestBody>) -> Result<Response<ResponseBody>> {
        self.handler.send(request).await
    }
}

/// A request under construction. Errors from the builder steps are kept
/// and returned by [`build`](Self::build) or [`send`](Self::send).
#[derive(Debug)]
pub struct RequestBuilder<'a> {
    client: &'a TestClient,
    request: Result<Request<RequestBody>>,
}

impl RequestBuilder<'_> {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let Ok(request) = &mut self.request {
            let parsed = HeaderName::from_bytes(name.as_bytes())
                .map_err(Error::from)
                .and_then(|name| Ok((name, HeaderValue::from_str(value)?)));
            match parsed {
                Ok((name, value)) => {
                    request.headers_mut().insert(name, value);
                }
                Err(err) => self.request = Err(err),
            }
        }
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        if let Ok(request) = &mut self.request {
            *request.body_mut() = body.into();
        }
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        if let Ok(request) = &mut self.request {
            match RequestBody::json(value) {
                Ok(body) => *request.body_mut() = body,
                Err(err) => self.request = Err(err),
            }
        }
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        if let Ok(request) = &mut self.request {
            *request.version_mut() = version;
        }
        self
    }

    /// Attach a value to the request extensions. With
    /// `preserve_execution_context` enabled it reaches the application's
    /// execution context.
    pub fn extension<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        if let Ok(request) = &mut self.request {
            request.extensions_mut().insert(value);
        }
        self
    }

    pub fn build(self) -> Result<Request<RequestBody>> {
        self.request
    }

    pub async fn send(self) -> Result<Response<ResponseBody>> {
        let client = self.client;
        let request = self.request?;
        client.handler.send(&request).await
    }

    pub async fn send_cancellable(
        self,
        token: &CancellationToken,
    ) -> Result<Response<ResponseBody>> {
        let client = self.client;
        let request = self.request?;
        client.handler.send_cancellable(&request, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::request_delegate;
    use crate::server::TestServer;

    fn server() -> TestServer {
        TestServer::new(request_delegate(|_| async { Ok(()) }))
    }

    #[test]
    fn relative_uri_is_resolved_against_the_base() {
        let server = server();
        let client = server.create_client();
        let request = client.get("items?page=2").build().unwrap();
        assert_eq!(request.uri(), "http://localhost/items?page=2");
        assert_eq!(request.method(), Method::GET);
    }

    #[test]
    fn default_headers_and_version_apply() {
        let server = server();
        let client = server
            .create_client()
            .with_default_header(HeaderName::from_static("x-tenant"), HeaderValue::from_static("a"))
            .with_version(Version::HTTP_2);
        let request = client.post("/").header("X-Extra", "1").build().unwrap();
        assert_eq!(request.headers().get("x-tenant").unwrap(), "a");
        assert_eq!(request.headers().get("x-extra").unwrap(), "1");
        assert_eq!(request.version(), Version::HTTP_2);
    }

    #[test]
    fn invalid_header_is_reported_on_build() {
        let server = server();
        let client = server.create_client();
        let err = client.get("/").header("bad header", "x").build().unwrap_err();
        assert!(matches!(err, Error::InvalidHeader(_)));
    }
}
