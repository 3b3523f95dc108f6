//! Service descriptor registry.
//!
//! The process-wide table of services, their methods, message schemas and
//! HTTP bindings. Services are registered at startup; the registry is sealed
//! when serving begins and is read-only afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use axum::http::Method;
use thiserror::Error;

use crate::schema::{FieldKind, MessageSchema, SchemaError};

pub mod path;
pub mod reflection;

pub use path::{PathTemplate, TemplateError};

#[derive(Error, Debug, PartialEq)]
pub enum RegistrationError {
    #[error("registry is sealed; services must be registered before serving starts")]
    Sealed,

    #[error("service `{0}` is already registered")]
    DuplicateService(String),

    #[error("service `{service}` declares method `{method}` more than once")]
    DuplicateMethod { service: String, method: String },

    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("message `{0}` is registered with two different definitions")]
    ConflictingSchema(String),

    #[error("{method}: invalid path template `{template}`: {source}")]
    InvalidTemplate {
        method: String,
        template: String,
        source: TemplateError,
    },

    #[error("{method}: `{field}` is not a field of the request message")]
    UnknownField { method: String, field: String },

    #[error("{method}: {verb} {template} overlaps {existing}")]
    AmbiguousRoute {
        method: String,
        verb: Method,
        template: String,
        existing: String,
    },
}

/// Which part of the request message the HTTP body populates.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum BodySelector {
    /// The body is ignored.
    #[default]
    None,
    /// The body is the whole request message (`*`).
    Whole,
    /// The body is the value of one top-level field.
    Field(String),
}

impl BodySelector {
    pub fn parse(body: &str) -> Self {
        match body {
            "" => BodySelector::None,
            "*" => BodySelector::Whole,
            field => BodySelector::Field(field.to_string()),
        }
    }
}

/// Maps a method onto an HTTP verb and path template.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpBinding {
    pub verb: Method,
    pub template: String,
    pub body: BodySelector,
}

impl HttpBinding {
    pub fn new(verb: Method, template: impl Into<String>) -> Self {
        Self {
            verb,
            template: template.into(),
            body: BodySelector::None,
        }
    }

    pub fn get(template: impl Into<String>) -> Self {
        Self::new(Method::GET, template)
    }

    pub fn post(template: impl Into<String>) -> Self {
        Self::new(Method::POST, template)
    }

    pub fn put(template: impl Into<String>) -> Self {
        Self::new(Method::PUT, template)
    }

    pub fn patch(template: impl Into<String>) -> Self {
        Self::new(Method::PATCH, template)
    }

    pub fn delete(template: impl Into<String>) -> Self {
        Self::new(Method::DELETE, template)
    }

    /// Sets the body selector: `*`, a field name, or empty for none.
    pub fn with_body(mut self, body: &str) -> Self {
        self.body = BodySelector::parse(body);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodDescriptor {
    pub name: String,
    /// Fully-qualified name of the owning service, set on registration.
    pub service: String,
    pub input: Arc<MessageSchema>,
    pub output: Arc<MessageSchema>,
    pub http: Option<HttpBinding>,
}

impl MethodDescriptor {
    pub fn new(
        name: impl Into<String>,
        input: Arc<MessageSchema>,
        output: Arc<MessageSchema>,
    ) -> Self {
        Self {
            name: name.into(),
            service: String::new(),
            input,
            output,
            http: None,
        }
    }

    pub fn with_http(mut self, binding: HttpBinding) -> Self {
        self.http = Some(binding);
        self
    }

    /// gRPC request path, `/package.Service/Method`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<Arc<MethodDescriptor>>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn with_method(mut self, mut method: MethodDescriptor) -> Self {
        method.service = self.name.clone();
        self.methods.push(Arc::new(method));
        self
    }

    pub fn package(&self) -> &str {
        self.name.rsplit_once('.').map(|(pkg, _)| pkg).unwrap_or("")
    }

    pub fn simple_name(&self) -> &str {
        self.name
            .rsplit_once('.')
            .map(|(_, name)| name)
            .unwrap_or(&self.name)
    }
}

/// A resolved HTTP route.
#[derive(Clone, Debug)]
pub struct RouteMatch {
    pub method: Arc<MethodDescriptor>,
    /// Path variables in template order, keyed by field path.
    pub params: Vec<(String, String)>,
}

struct Route {
    verb: Method,
    template: PathTemplate,
    method: Arc<MethodDescriptor>,
}

#[derive(Default)]
struct Inner {
    services: Vec<Arc<ServiceDescriptor>>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
    schemas: HashMap<String, Arc<MessageSchema>>,
    routes: Vec<Route>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
    sealed: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Registry::register`].
    pub fn with_service(self, service: ServiceDescriptor) -> Result<Self, RegistrationError> {
        self.register(service)?;
        Ok(self)
    }

    pub fn register(&self, service: ServiceDescriptor) -> Result<(), RegistrationError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // Checked under the write lock so a concurrent seal cannot interleave.
        if self.is_sealed() {
            return Err(RegistrationError::Sealed);
        }
        if inner.services.iter().any(|s| s.name == service.name) {
            return Err(RegistrationError::DuplicateService(service.name));
        }

        let mut schemas = HashMap::new();
        let mut routes = Vec::new();
        for (i, method) in service.methods.iter().enumerate() {
            if service.methods[..i].iter().any(|m| m.name == method.name) {
                return Err(RegistrationError::DuplicateMethod {
                    service: service.name.clone(),
                    method: method.name.clone(),
                });
            }
            for root in [&method.input, &method.output] {
                root.check()?;
                for schema in MessageSchema::reachable(root) {
                    let known = inner
                        .schemas
                        .get(schema.full_name())
                        .or_else(|| schemas.get(schema.full_name()));
                    match known {
                        Some(existing) if **existing != *schema => {
                            return Err(RegistrationError::ConflictingSchema(
                                schema.full_name().to_string(),
                            ));
                        }
                        Some(_) => {}
                        None => {
                            schemas.insert(schema.full_name().to_string(), schema);
                        }
                    }
                }
            }
            if let Some(binding) = &method.http {
                let route = check_binding(method, binding)?;
                let existing = inner.routes.iter().chain(routes.iter()).find(|r: &&Route| {
                    r.verb == route.verb && r.template.shape() == route.template.shape()
                });
                if let Some(existing) = existing {
                    return Err(RegistrationError::AmbiguousRoute {
                        method: method.path(),
                        verb: route.verb,
                        template: route.template.to_string(),
                        existing: format!("{} ({})", existing.template, existing.method.path()),
                    });
                }
                routes.push(route);
            }
        }

        tracing::debug!(
            service = %service.name,
            methods = service.methods.len(),
            routes = routes.len(),
            "Registered service"
        );
        for method in &service.methods {
            inner.methods.insert(method.path(), Arc::clone(method));
        }
        inner.schemas.extend(schemas);
        inner.routes.extend(routes);
        inner.services.push(Arc::new(service));
        Ok(())
    }

    /// Freezes the registry. Further registrations fail with
    /// [`RegistrationError::Sealed`].
    pub fn seal(&self) {
        let _inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<Arc<MethodDescriptor>> {
        self.lookup_path(&format!("/{service}/{method}"))
    }

    /// Looks up a method by its gRPC path, `/package.Service/Method`.
    pub fn lookup_path(&self, path: &str) -> Option<Arc<MethodDescriptor>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.methods.get(path).cloned()
    }

    /// Finds the most specific binding for `verb` that matches `path`. Ties
    /// go to the binding registered first.
    pub fn resolve_http(&self, verb: &Method, path: &str) -> Option<RouteMatch> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut best: Option<(&Route, Vec<(String, String)>)> = None;
        for route in inner.routes.iter().filter(|r| r.verb == *verb) {
            let Some(params) = route.template.matches(path) else {
                continue;
            };
            let better = best.as_ref().is_none_or(|(current, _)| {
                route.template.specificity() > current.template.specificity()
            });
            if better {
                best = Some((route, params));
            }
        }
        best.map(|(route, params)| RouteMatch {
            method: Arc::clone(&route.method),
            params,
        })
    }

    pub fn services(&self) -> Vec<Arc<ServiceDescriptor>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.services.clone()
    }

    /// Every message schema used by a registered method, including nested
    /// ones, sorted by name.
    pub fn schemas(&self) -> Vec<Arc<MessageSchema>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut schemas: Vec<_> = inner.schemas.values().cloned().collect();
        schemas.sort_by(|a, b| a.full_name().cmp(b.full_name()));
        schemas
    }
}

/// Parses the template and checks that every variable and the body field
/// name fields of the input message.
fn check_binding(
    method: &Arc<MethodDescriptor>,
    binding: &HttpBinding,
) -> Result<Route, RegistrationError> {
    let template =
        PathTemplate::parse(&binding.template).map_err(|source| {
            RegistrationError::InvalidTemplate {
                method: method.path(),
                template: binding.template.clone(),
                source,
            }
        })?;
    let unknown = |field: &str| RegistrationError::UnknownField {
        method: method.path(),
        field: field.to_string(),
    };

    for var in template.variables() {
        let resolved = method
            .input
            .resolve_path(&var.field)
            .ok_or_else(|| unknown(&var.field))?;
        let leaf = resolved.last().ok_or_else(|| unknown(&var.field))?;
        if leaf.repeated || matches!(leaf.kind, FieldKind::Message(_)) {
            return Err(unknown(&var.field));
        }
    }
    if let BodySelector::Field(field) = &binding.body {
        if method.input.field(field).is_none() {
            return Err(unknown(field));
        }
    }

    Ok(Route {
        verb: binding.verb.clone(),
        template,
        method: Arc::clone(method),
    })
}
