//! Endpoints and blueprints.
//!
//! An endpoint binds a route template to an async handler, with optional
//! pre-invoke hook, local error handler and per-argument converters. A
//! blueprint is an ordered collection of endpoints sharing an optional
//! class-wide error handler.

use std::future::Future;
use std::rc::Rc;

use futures_core::future::LocalBoxFuture;
use tracing::trace;

use crate::error::User;

use super::converters::{Converter, ConverterCache, Value};
use super::request::Request;
use super::response::Response;
use super::router::{compile, CompiledRoute};

/// The endpoint callback: the request plus converted route arguments.
pub type Handler =
    Rc<dyn Fn(Request, Vec<Value>) -> LocalBoxFuture<'static, crate::Result<Response>>>;

/// Runs before the handler; may replace the request by returning one.
pub type BeforeInvoke =
    Rc<dyn Fn(Request) -> LocalBoxFuture<'static, crate::Result<Option<Request>>>>;

/// Handles an error from the pipeline. `Ok(Some(_))` answers with a
/// response, `Ok(None)` silences the error, `Err(_)` re-raises.
pub type ErrorHandler =
    Rc<dyn Fn(Request, crate::Error) -> LocalBoxFuture<'static, crate::Result<Option<Response>>>>;

/// Starts building an endpoint for `route`.
///
/// The handler receives the request and the converted arguments, one per
/// `{name:converter}` placeholder, in template order.
pub fn endpoint<F, Fut>(route: &str, handler: F) -> EndpointBuilder
where
    F: Fn(Request, Vec<Value>) -> Fut + 'static,
    Fut: Future<Output = crate::Result<Response>> + 'static,
{
    let handler: Handler = Rc::new(move |request, args| Box::pin(handler(request, args)));
    EndpointBuilder {
        route: route.to_owned(),
        handler,
        converters: None,
        cache: None,
        before_invoke: None,
        on_error: None,
    }
}

/// An endpoint under construction; consumed by [`Blueprint::endpoint`].
#[must_use = "endpoint builders do nothing until bound to a blueprint"]
pub struct EndpointBuilder {
    route: String,
    handler: Handler,
    converters: Option<Vec<Converter>>,
    cache: Option<Rc<dyn ConverterCache>>,
    before_invoke: Option<BeforeInvoke>,
    on_error: Option<ErrorHandler>,
}

impl EndpointBuilder {
    /// Replaces the converters generated from the template. The list must
    /// have one entry per placeholder.
    pub fn converters<I: IntoIterator<Item = Converter>>(mut self, converters: I) -> Self {
        self.converters = Some(converters.into_iter().collect());
        self
    }

    /// Wraps every converter of this endpoint with `cache`.
    pub fn converter_cache(mut self, cache: Rc<dyn ConverterCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Hook run before the handler. Returning `Ok(Some(request))` replaces
    /// the request; an error skips the handler and goes straight to the
    /// error chain.
    pub fn before_invoke<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Request) -> Fut + 'static,
        Fut: Future<Output = crate::Result<Option<Request>>> + 'static,
    {
        self.before_invoke = Some(Rc::new(move |request| Box::pin(hook(request))));
        self
    }

    /// Local error handler, consulted before the blueprint-wide one.
    pub fn on_error<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Request, crate::Error) -> Fut + 'static,
        Fut: Future<Output = crate::Result<Option<Response>>> + 'static,
    {
        self.on_error = Some(Rc::new(move |request, error| {
            Box::pin(handler(request, error))
        }));
        self
    }

    fn build(self) -> crate::Result<Endpoint> {
        let route = compile(&self.route)?;
        let converters = match self.converters {
            Some(converters) => {
                if converters.len() != route.params.len() {
                    return Err(crate::Error::new_user(User::Route));
                }
                converters
            }
            None => route
                .converters
                .iter()
                .map(|name| Converter::from_template(name))
                .collect(),
        };
        let converters = match self.cache {
            Some(cache) => converters
                .into_iter()
                .map(|converter| converter.cached(cache.clone()))
                .collect(),
            None => converters,
        };
        Ok(Endpoint {
            route,
            handler: self.handler,
            converters,
            before_invoke: self.before_invoke,
            on_error: self.on_error,
        })
    }
}

impl std::fmt::Debug for EndpointBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointBuilder")
            .field("route", &self.route)
            .finish()
    }
}

/// A bound endpoint. Immutable after blueprint attachment.
pub struct Endpoint {
    route: CompiledRoute,
    handler: Handler,
    converters: Vec<Converter>,
    before_invoke: Option<BeforeInvoke>,
    on_error: Option<ErrorHandler>,
}

impl Endpoint {
    pub(crate) fn route(&self) -> &CompiledRoute {
        &self.route
    }

    pub fn raw_route(&self) -> &str {
        &self.route.raw
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("route", &self.route.raw)
            .field("converters", &self.converters.len())
            .field("before_invoke", &self.before_invoke.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// A named, ordered collection of endpoints.
pub struct Blueprint {
    name: String,
    endpoints: Vec<Rc<Endpoint>>,
    on_error: Option<ErrorHandler>,
}

impl Blueprint {
    pub fn new(name: impl Into<String>) -> Blueprint {
        Blueprint {
            name: name.into(),
            endpoints: Vec::new(),
            on_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds an endpoint, panicking on an invalid template or converter
    /// list. Use [`try_endpoint`](Blueprint::try_endpoint) to handle the
    /// error instead.
    pub fn endpoint(self, builder: EndpointBuilder) -> Blueprint {
        let route = builder.route.clone();
        self.try_endpoint(builder)
            .unwrap_or_else(|e| panic!("error binding endpoint {:?}: {}", route, e))
    }

    /// Binds an endpoint.
    pub fn try_endpoint(mut self, builder: EndpointBuilder) -> crate::Result<Blueprint> {
        let endpoint = builder.build()?;
        trace!(
            "blueprint {:?} bound endpoint {:?}",
            self.name,
            endpoint.route.raw
        );
        self.endpoints.push(Rc::new(endpoint));
        Ok(self)
    }

    /// Class-wide error handler, consulted after an endpoint's own.
    pub fn on_error<F, Fut>(mut self, handler: F) -> Blueprint
    where
        F: Fn(Request, crate::Error) -> Fut + 'static,
        Fut: Future<Output = crate::Result<Option<Response>>> + 'static,
    {
        self.on_error = Some(Rc::new(move |request, error| {
            Box::pin(handler(request, error))
        }));
        self
    }

    pub(crate) fn endpoints(&self) -> &[Rc<Endpoint>] {
        &self.endpoints
    }

    /// Runs the full invoke pipeline for one matched endpoint.
    ///
    /// Pre-invoke (which may replace the request, and whose error skips the
    /// handler), then converters in declaration order, then the handler; any
    /// error walks the chain: endpoint handler, then this blueprint's, then
    /// out to the caller. `Ok(None)` means an error handler chose to stay
    /// silent.
    pub(crate) async fn invoke_endpoint(
        &self,
        endpoint: &Endpoint,
        request: Request,
        args: &[(String, String)],
    ) -> crate::Result<Option<Response>> {
        let mut request = request;
        let outcome = async {
            if let Some(before) = &endpoint.before_invoke {
                if let Some(replacement) = before(request.clone()).await? {
                    request = replacement;
                }
            }
            let mut values = Vec::with_capacity(endpoint.converters.len());
            for (converter, (_, raw)) in endpoint.converters.iter().zip(args) {
                values.push(converter.convert(raw)?);
            }
            (endpoint.handler)(request.clone(), values).await
        }
        .await;

        let mut error = match outcome {
            Ok(response) => return Ok(Some(response)),
            Err(error) => error,
        };
        if let Some(handler) = &endpoint.on_error {
            match handler(request.clone(), error).await {
                Ok(handled) => return Ok(handled),
                Err(reraised) => error = reraised,
            }
        }
        if let Some(handler) = &self.on_error {
            match handler(request.clone(), error).await {
                Ok(handled) => return Ok(handled),
                Err(reraised) => error = reraised,
            }
        }
        Err(error)
    }
}

impl std::fmt::Debug for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blueprint")
            .field("name", &self.name)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}
