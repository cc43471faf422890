// Request routing for the service's HTTP endpoint

use crate::{Error, Result};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use http_body_util::Full;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Response type produced by handlers.
pub type Response = http::Response<Full<Bytes>>;

/// A type-erased route handler.
pub type HandlerFn = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// A fully-read HTTP request handed to a handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Values captured by `{name}` segments of the route pattern
    pub params: HashMap<String, String>,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            params: HashMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Deserialize the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Build a JSON response.
pub fn json<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => respond(status, "application/json", Bytes::from(bytes)),
        Err(e) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode response: {e}"),
        ),
    }
}

/// Build a plain-text response.
pub fn text(status: StatusCode, body: impl Into<String>) -> Response {
    respond(
        status,
        "text/plain; charset=utf-8",
        Bytes::from(body.into()),
    )
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response {
    let mut response = http::Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[derive(Clone)]
struct Route {
    method: Method,
    path: String,
    handler: HandlerFn,
}

/// Collects routes before the service starts serving.
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. Path segments written as `{name}` capture a parameter.
    ///
    /// A later route on the same method and path replaces the earlier one.
    pub fn route<F, Fut>(
        &mut self,
        method: Method,
        path: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |req: Request| -> BoxFuture<'static, Response> {
            Box::pin(handler(req))
        });
        self.insert(method, path.into(), handler);
        self
    }

    pub fn get<F, Fut>(&mut self, path: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::GET, path, handler)
    }

    pub fn post<F, Fut>(&mut self, path: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::POST, path, handler)
    }

    pub(crate) fn insert(&mut self, method: Method, path: String, handler: HandlerFn) {
        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|r| r.method == method && r.path == path)
        {
            warn!(method = %method, path = %path, "Replacing existing route");
            existing.handler = handler;
        } else {
            self.routes.push(Route {
                method,
                path,
                handler,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Compile the routes into a lookup table.
    pub fn build(&self) -> Result<RouteTable> {
        let mut by_method: HashMap<Method, matchit::Router<HandlerFn>> = HashMap::new();

        for route in &self.routes {
            by_method
                .entry(route.method.clone())
                .or_default()
                .insert(route.path.clone(), route.handler.clone())
                .map_err(|e| Error::Route(format!("{} {}: {}", route.method, route.path, e)))?;
        }

        Ok(RouteTable { by_method })
    }
}

/// Immutable route lookup used while serving.
pub struct RouteTable {
    by_method: HashMap<Method, matchit::Router<HandlerFn>>,
}

impl RouteTable {
    /// Dispatch a request to its handler.
    ///
    /// Unknown paths get 404, known paths under another method get 405.
    pub async fn dispatch(&self, mut request: Request) -> Response {
        let handler = self.by_method.get(&request.method).and_then(|router| {
            router.at(request.uri.path()).ok().map(|matched| {
                let params = matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<HashMap<_, _>>();
                (matched.value.clone(), params)
            })
        });

        if let Some((handler, params)) = handler {
            request.params = params;
            return handler(request).await;
        }

        let path_known = self
            .by_method
            .values()
            .any(|router| router.at(request.uri.path()).is_ok());

        if path_known {
            json(
                StatusCode::METHOD_NOT_ALLOWED,
                &serde_json::json!({ "error": format!("method {} not allowed", request.method) }),
            )
        } else {
            json(
                StatusCode::NOT_FOUND,
                &serde_json::json!({ "error": format!("no route for {}", request.uri.path()) }),
            )
        }
    }
}
