//! Controller - the configuration phase of a service.
//!
//! A [`Controller`] collects methods, middleware, exception handlers and an
//! optional scheduler. [`Controller::build`] validates everything against the
//! service descriptor, composes one interceptor chain per method and freezes
//! the result into an immutable [`Service`].
//!
//! # Example
//!
//! ```
//! use rpc_dispatch::controller::Controller;
//! use rpc_dispatch::method::{Method, MethodMode};
//! use rpc_dispatch::transport::{MethodDescriptor, ServiceDescriptor};
//! use serde_json::{json, Value};
//!
//! let mut controller = Controller::new("Greeter").package("greeter");
//! controller.register(Method::unary_unary("say_hello", |req: Value, _ctx, _deps| async move {
//!     Ok(json!({ "message": format!("Hello {}", req["name"].as_str().unwrap_or("")) }))
//! }))?;
//!
//! let descriptor = ServiceDescriptor::new("greeter.Greeter").method(MethodDescriptor::new(
//!     "greeter.Greeter",
//!     "SayHello",
//!     MethodMode::UnaryUnary,
//!     "greeter.HelloRequest",
//!     "greeter.HelloReply",
//! ));
//! let service = controller.descriptor(descriptor).build()?;
//! assert!(service.method("SayHello").is_some());
//! # Ok::<(), rpc_dispatch::error::ConfigError>(())
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;

use crate::context::CallContext;
use crate::error::ConfigError;
use crate::exception::ExceptionRegistry;
use crate::message::Message;
use crate::method::Method;
use crate::middleware::{
    ChainBuilder, ContextBinding, ExceptionStage, Middleware, SchedulerStage,
};
use crate::scheduler::Scheduler;
use crate::service::{BoundMethod, Service};
use crate::transport::{MethodDescriptor, ServiceDescriptor};

/// Default cap on the request summary in log lines.
pub const DEFAULT_LOG_PAYLOAD_LIMIT: usize = 256;

/// Plain-data controller settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Service name, e.g. `Greeter`.
    pub name: String,
    /// Package the service lives in, e.g. `greeter`. May be empty.
    pub package: String,
    /// Maximum characters of request payload rendered in log lines.
    pub log_payload_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "Service".to_string(),
            package: String::new(),
            log_payload_limit: DEFAULT_LOG_PAYLOAD_LIMIT,
        }
    }
}

impl ControllerConfig {
    /// Fully qualified service name: `package.Name`, or `Name` without a package.
    pub fn service_name(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.package, self.name)
        }
    }
}

/// Service under construction.
pub struct Controller {
    config: ControllerConfig,
    methods: Vec<Method>,
    middleware: Vec<Middleware>,
    handlers: ExceptionRegistry,
    scheduler: Option<Scheduler>,
    descriptor: Option<ServiceDescriptor>,
}

impl Controller {
    /// Controller for the service `name`, with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(ControllerConfig {
            name: name.into(),
            ..ControllerConfig::default()
        })
    }

    pub fn from_config(config: ControllerConfig) -> Self {
        Self {
            config,
            methods: Vec::new(),
            middleware: Vec::new(),
            handlers: ExceptionRegistry::new(),
            scheduler: None,
            descriptor: None,
        }
    }

    /// Set the package.
    pub fn package(mut self, package: impl Into<String>) -> Self {
        self.config.package = package.into();
        self
    }

    /// Set the request-summary cap for log lines.
    pub fn log_payload_limit(mut self, limit: usize) -> Self {
        self.config.log_payload_limit = limit;
        self
    }

    /// Attach a background scheduler to every call.
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Validate methods against, and bind calls to, this service descriptor.
    pub fn descriptor(mut self, descriptor: ServiceDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The descriptor's name when one is attached, else `package.Name`.
    pub fn service_name(&self) -> String {
        match &self.descriptor {
            Some(descriptor) => descriptor.name.clone(),
            None => self.config.service_name(),
        }
    }

    /// Register a method. Names must be unique.
    pub fn register(&mut self, method: Method) -> Result<&mut Self, ConfigError> {
        if self.methods.iter().any(|m| m.name() == method.name()) {
            return Err(ConfigError::DuplicateMethod(method.name().to_string()));
        }
        tracing::debug!("registered {} ({})", method.name(), method.mode());
        self.methods.push(method);
        Ok(self)
    }

    /// Move every method of `other` into this controller.
    pub fn include(&mut self, other: Controller) -> Result<&mut Self, ConfigError> {
        for method in other.methods {
            self.register(method)?;
        }
        Ok(self)
    }

    /// Add interceptors inside those already added.
    pub fn add_middleware<I>(&mut self, middleware: I) -> &mut Self
    where
        I: IntoIterator<Item = Middleware>,
    {
        self.middleware.extend(middleware);
        self
    }

    /// Add interceptors outside those already added, keeping their order.
    ///
    /// Built-in stages always stay outermost.
    pub fn prepend_middleware<I>(&mut self, middleware: I) -> &mut Self
    where
        I: IntoIterator<Item = Middleware>,
    {
        let mut combined: Vec<Middleware> = middleware.into_iter().collect();
        combined.append(&mut self.middleware);
        self.middleware = combined;
        self
    }

    /// Merge exception handlers, replacing ours for the same error types.
    pub fn add_exception_handlers(&mut self, handlers: ExceptionRegistry) -> &mut Self {
        self.handlers.merge(handlers);
        self
    }

    /// Register one exception handler.
    pub fn on_exception<E, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        E: std::error::Error + 'static,
        F: Fn(Option<Message>, CallContext, &E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.on(handler);
        self
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter()
    }

    /// Freeze the configuration into a [`Service`].
    pub fn build(self) -> Result<Service, ConfigError> {
        let service_name = self.service_name();
        if self.methods.is_empty() {
            tracing::info!("{} build [Ignored] -> no methods", service_name);
            return Ok(Service::new(service_name, Vec::new()));
        }

        let limit = self.config.log_payload_limit;
        let mut chain = ChainBuilder::new();
        chain.push(Middleware::both(ContextBinding)).push(Middleware::both(
            ExceptionStage::new(Arc::new(self.handlers), limit),
        ));
        if let Some(scheduler) = self.scheduler {
            chain.push(Middleware::both(SchedulerStage::new(scheduler)));
        }
        for middleware in self.middleware {
            chain.push(middleware);
        }

        let mut bound = Vec::with_capacity(self.methods.len());
        for method in self.methods {
            let descriptor = match &self.descriptor {
                Some(service) => Some(Arc::new(bind_descriptor(service, &method)?)),
                None => None,
            };
            bound.push(BoundMethod::new(Arc::new(method), descriptor, &chain, limit));
        }

        tracing::info!("{} build success ({} methods)", service_name, bound.len());
        Ok(Service::new(service_name, bound))
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.service_name())
            .field("methods", &self.methods.len())
            .field("middleware", &self.middleware.len())
            .field("handlers", &self.handlers)
            .field("scheduler", &self.scheduler.is_some())
            .finish()
    }
}

/// `HelloRequest` matches both `HelloRequest` and `greeter.HelloRequest`.
fn schema_matches(schema: &str, declared: &str) -> bool {
    declared == schema || declared.rsplit('.').next() == Some(schema)
}

fn bind_descriptor(
    service: &ServiceDescriptor,
    method: &Method,
) -> Result<MethodDescriptor, ConfigError> {
    let descriptor = service.get(method.name()).ok_or_else(|| {
        ConfigError::UnknownMethod(method.name().to_string(), service.name.clone())
    })?;

    if descriptor.mode() != method.mode() {
        return Err(ConfigError::ModeMismatch {
            method: method.name().to_string(),
            registered: method.mode().to_string(),
            declared: descriptor.mode().to_string(),
        });
    }

    let sides = [
        ("request", method.request_schema(), &descriptor.input_type),
        ("response", method.response_schema(), &descriptor.output_type),
    ];
    for (side, schema, declared) in sides {
        if let Some(schema) = schema {
            if !schema_matches(schema, declared) {
                return Err(ConfigError::SchemaMismatch {
                    method: method.name().to_string(),
                    side,
                    schema: schema.to_string(),
                    declared: declared.clone(),
                });
            }
        }
    }
    Ok(descriptor.clone())
}

#[cfg(test)]
mod tests {
    use serde::Serialize;
    use serde_json::{json, Value};

    use super::*;
    use crate::message::Schema;
    use crate::method::{EndpointResult, MethodMode};

    #[derive(Serialize, serde::Deserialize)]
    struct Ping {
        id: u32,
    }

    impl Schema for Ping {
        const NAME: &'static str = "Ping";
    }

    fn ping() -> Method {
        Method::unary_unary("ping", |p: Ping, _, _| async move { Ok(p) })
    }

    fn descriptor(mode: MethodMode, input: &str) -> ServiceDescriptor {
        ServiceDescriptor::new("health.Health").method(MethodDescriptor::new(
            "health.Health",
            "Ping",
            mode,
            input,
            "health.Ping",
        ))
    }

    #[test]
    fn test_config_defaults_and_deserialize() {
        let config = ControllerConfig::default();
        assert_eq!(config.log_payload_limit, DEFAULT_LOG_PAYLOAD_LIMIT);
        assert_eq!(config.service_name(), "Service");

        let config: ControllerConfig =
            serde_json::from_value(json!({"name": "Greeter", "package": "greeter"})).unwrap();
        assert_eq!(config.service_name(), "greeter.Greeter");
        assert_eq!(config.log_payload_limit, DEFAULT_LOG_PAYLOAD_LIMIT);
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let mut controller = Controller::new("Health");
        controller.register(ping()).unwrap();
        let err = controller.register(ping()).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateMethod("Ping".into()));
    }

    #[test]
    fn test_include_merges_methods() {
        let mut main = Controller::new("Health");
        main.register(ping()).unwrap();

        let mut extra = Controller::new("Other");
        extra
            .register(Method::unary_stream("watch", |_: Value, _, _| {
                futures::stream::empty::<EndpointResult<Value>>()
            }))
            .unwrap();

        main.include(extra).unwrap();
        let names: Vec<&str> = main.methods().map(|m| m.name()).collect();
        assert_eq!(names, vec!["Ping", "Watch"]);
    }

    #[test]
    fn test_build_validates_against_descriptor() {
        let mut controller = Controller::new("Health");
        controller.register(ping()).unwrap();
        let service = controller
            .descriptor(descriptor(MethodMode::UnaryUnary, "health.Ping"))
            .build()
            .unwrap();
        assert_eq!(service.name(), "health.Health");
        assert_eq!(
            service.method("Ping").unwrap().descriptor().unwrap().full_name(),
            "/health.Health/Ping"
        );
    }

    #[test]
    fn test_build_rejects_mode_mismatch() {
        let mut controller = Controller::new("Health");
        controller.register(ping()).unwrap();
        let err = controller
            .descriptor(descriptor(MethodMode::UnaryStream, "health.Ping"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ModeMismatch { .. }));
    }

    #[test]
    fn test_build_rejects_schema_mismatch() {
        let mut controller = Controller::new("Health");
        controller.register(ping()).unwrap();
        let err = controller
            .descriptor(descriptor(MethodMode::UnaryUnary, "health.Pong"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::SchemaMismatch {
                method: "Ping".into(),
                side: "request",
                schema: "Ping".into(),
                declared: "health.Pong".into(),
            }
        );
    }

    #[test]
    fn test_build_rejects_unknown_method() {
        let mut controller = Controller::new("Health");
        controller
            .register(Method::unary_unary("status", |v: Value, _, _| async move { Ok(v) }))
            .unwrap();
        let err = controller
            .descriptor(descriptor(MethodMode::UnaryUnary, "health.Ping"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownMethod("Status".into(), "health.Health".into())
        );
    }

    #[test]
    fn test_empty_controller_builds_empty_service() {
        let service = Controller::new("Empty").package("pkg").build().unwrap();
        assert_eq!(service.name(), "pkg.Empty");
        assert!(service.is_empty());
    }

    #[test]
    fn test_schema_matches() {
        assert!(schema_matches("Ping", "Ping"));
        assert!(schema_matches("Ping", "health.Ping"));
        assert!(!schema_matches("Ping", "health.PingRequest"));
    }
}
