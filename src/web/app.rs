//! The application: blueprints, matcher, and the gateway entry point.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use futures_core::future::LocalBoxFuture;
use tracing::{debug, trace, warn};

use crate::sgi::{ReceiveHandle, Scope, SendHandle};

use super::blueprint::{Blueprint, Endpoint};
use super::cookies::Cookies;
use super::request::Request;
use super::response::Response;
use super::router::RouteMatcher;
use super::session::{Session, SessionSigner};

/// The application aggregates blueprints and answers gateway requests.
///
/// Endpoints across blueprints are indexed flat — each matcher hit yields a
/// `(blueprint, endpoint)` index pair, so there are no back-pointers from
/// endpoints into the application.
#[derive(Clone)]
pub struct App {
    inner: Rc<RefCell<Inner>>,
    signer: Rc<SessionSigner>,
}

struct Inner {
    blueprints: Vec<Rc<Blueprint>>,
    /// Flat endpoint index: (blueprint index, endpoint index).
    endpoints: Vec<(usize, usize)>,
    matcher: RouteMatcher,
}

impl App {
    /// Builds an application with the session key from the environment.
    ///
    /// Refuses to start when `SECURE_KEY` is unset and `DEBUG` is not
    /// truthy.
    pub fn new() -> crate::Result<App> {
        Ok(App::with_signer(SessionSigner::from_env()?))
    }

    /// Builds an application with an explicit session secret.
    pub fn with_secret(secret: &str) -> App {
        App::with_signer(SessionSigner::new(secret))
    }

    pub fn with_signer(signer: SessionSigner) -> App {
        App {
            inner: Rc::new(RefCell::new(Inner {
                blueprints: Vec::new(),
                endpoints: Vec::new(),
                matcher: RouteMatcher::default(),
            })),
            signer: Rc::new(signer),
        }
    }

    /// Appends a blueprint's endpoints and rebuilds the matcher. The swap is
    /// observed atomically by the next request.
    pub fn add_blueprint(&self, blueprint: Blueprint) {
        let mut inner = self.inner.borrow_mut();
        let blueprint_index = inner.blueprints.len();
        for endpoint_index in 0..blueprint.endpoints().len() {
            inner.endpoints.push((blueprint_index, endpoint_index));
        }
        inner.blueprints.push(Rc::new(blueprint));

        let routes: Vec<_> = inner
            .endpoints
            .iter()
            .enumerate()
            .map(|(flat, &(bp, ep))| {
                let route = inner.blueprints[bp].endpoints()[ep].route().clone();
                (flat, route)
            })
            .collect();
        inner.matcher = RouteMatcher::build(routes.iter().map(|(flat, route)| (*flat, route)));
        trace!("matcher rebuilt with {} routes", inner.matcher.len());
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.borrow().endpoints.len()
    }

    /// The gateway entry point, in the shape [`Server::serve`] expects.
    ///
    /// [`Server::serve`]: crate::server::Builder::serve
    pub fn sgi(
        &self,
    ) -> impl Fn(Scope, ReceiveHandle, SendHandle) -> LocalBoxFuture<'static, ()> {
        let app = self.clone();
        move |scope, receive, send| -> LocalBoxFuture<'static, ()> {
            let app = app.clone();
            Box::pin(async move {
                app.handle(scope, receive, send).await;
            })
        }
    }

    /// Serves one request: match, invoke, respond. Errors never escape.
    async fn handle(&self, scope: Scope, receive: ReceiveHandle, send: SendHandle) {
        let matched = {
            let inner = self.inner.borrow();
            inner.matcher.get(&scope.path).map(|(flat, args)| {
                let (bp, ep) = inner.endpoints[flat];
                let blueprint = inner.blueprints[bp].clone();
                let endpoint = blueprint.endpoints()[ep].clone();
                (blueprint, endpoint, args)
            })
        };

        let (status, headers, body) = match matched {
            None => {
                trace!("no route matches {:?}", scope.path);
                plain_response(404, "Not Found")
            }
            Some((blueprint, endpoint, args)) => {
                self.dispatch(&blueprint, &endpoint, args, scope, receive)
                    .await
            }
        };

        if let Err(e) = send.start(status, &headers).await {
            debug!("response start failed: {}", e);
            return;
        }
        if let Err(e) = send.body(false, body).await {
            debug!("response body failed: {}", e);
        }
    }

    async fn dispatch(
        &self,
        blueprint: &Blueprint,
        endpoint: &Endpoint,
        args: Vec<(String, String)>,
        scope: Scope,
        receive: ReceiveHandle,
    ) -> (u16, Vec<(Bytes, Bytes)>, Bytes) {
        let cookies = Cookies::from_headers(&scope.headers);
        let session = Session::from_cookies(&cookies, &self.signer);
        let request = Request::new(
            scope.method,
            scope.path,
            scope.query,
            args.clone(),
            scope.headers,
            cookies,
            session,
            receive,
            scope.client,
            scope.server,
        );

        match blueprint
            .invoke_endpoint(endpoint, request.clone(), &args)
            .await
        {
            Ok(Some(response)) => {
                request.flush_session(&self.signer);
                let (status, mut headers, body) = response.into_parts();
                if request.cookies_dirty() {
                    headers.extend(request.set_cookie_headers());
                }
                (status, headers, body)
            }
            Ok(None) => {
                // An error handler chose silence; there is no response to
                // send, which coerces to a 500.
                debug!("endpoint {:?} produced no response", endpoint.raw_route());
                plain_response(500, "Internal Server Error")
            }
            Err(error) => {
                warn!(
                    "unhandled error from endpoint {:?}: {}",
                    endpoint.raw_route(),
                    error
                );
                plain_response(500, "Internal Server Error")
            }
        }
    }
}

fn plain_response(status: u16, body: &'static str) -> (u16, Vec<(Bytes, Bytes)>, Bytes) {
    let mut buffer = itoa::Buffer::new();
    (
        status,
        vec![
            (
                Bytes::from_static(b"content-length"),
                Bytes::copy_from_slice(buffer.format(body.len()).as_bytes()),
            ),
            (
                Bytes::from_static(b"content-type"),
                Bytes::from_static(b"text/plain"),
            ),
        ],
        Bytes::from_static(body.as_bytes()),
    )
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("App")
            .field("blueprints", &inner.blueprints.len())
            .field("endpoints", &inner.endpoints.len())
            .finish()
    }
}
