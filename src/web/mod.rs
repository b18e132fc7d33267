//! The routing framework layered on the gateway interface: applications,
//! blueprints, endpoints, typed argument converters, cookies and signed
//! sessions.

mod app;
mod blueprint;
mod converters;
mod cookies;
mod request;
mod response;
mod router;
mod session;

pub use self::app::App;
pub use self::blueprint::{
    endpoint, Blueprint, BeforeInvoke, Endpoint, EndpointBuilder, ErrorHandler, Handler,
};
pub use self::converters::{Converter, ConverterCache, ConversionFailure, MemoCache, Target, Value};
pub use self::cookies::Cookies;
pub use self::request::{Headers, Parameters, Request};
pub use self::response::Response;
pub use self::session::{Session, SessionSigner};
