//! Route table: HTTP method + path → RPC procedure.
//!
//! Built once from a [`ServiceDefinition`] when the gateway is constructed and
//! read concurrently by every request afterwards.

use crate::service::{BodyRule, ServiceDefinition, Transcoder};
use crate::{Result, TwinportError};
use axum::http::Method;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed path template such as `/v1/sayhi/{name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let invalid = |message: String| TwinportError::Config {
            message: format!("Invalid path template '{}': {}", template, message),
        };

        let rest = template
            .strip_prefix('/')
            .ok_or_else(|| invalid("must start with '/'".to_string()))?;

        let mut segments = Vec::new();
        for part in rest.split('/') {
            if part.is_empty() {
                return Err(invalid("empty segment".to_string()));
            }
            if let Some(inner) = part.strip_prefix('{') {
                let field = inner
                    .strip_suffix('}')
                    .ok_or_else(|| invalid(format!("unterminated field '{}'", part)))?;
                if field.is_empty() || field.contains(['{', '}']) {
                    return Err(invalid(format!("bad field '{}'", part)));
                }
                segments.push(Segment::Field(field.to_string()));
            } else if part.contains(['{', '}']) {
                return Err(invalid(format!("bad segment '{}'", part)));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Match a request path, returning the captured fields.
    ///
    /// Captured values are percent-decoded. A trailing slash is ignored.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let path = path.strip_prefix('/')?;
        let path = path.strip_suffix('/').unwrap_or(path);
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut captures = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != part {
                        return None;
                    }
                }
                Segment::Field(field) => {
                    if part.is_empty() {
                        return None;
                    }
                    let value = urlencoding::decode(part).ok()?;
                    captures.push((field.clone(), value.into_owned()));
                }
            }
        }
        Some(captures)
    }
}

/// One HTTP route bound to a procedure.
#[derive(Clone)]
pub struct RouteBinding {
    pub method: Method,
    pub template: PathTemplate,
    pub procedure: String,
    pub body: BodyRule,
    pub transcoder: Arc<dyn Transcoder>,
}

impl std::fmt::Debug for RouteBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteBinding")
            .field("method", &self.method)
            .field("template", &self.template.as_str())
            .field("procedure", &self.procedure)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// A resolved route plus the path fields it captured.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub binding: &'a RouteBinding,
    pub captures: Vec<(String, String)>,
}

/// Immutable table of route bindings.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    bindings: Vec<RouteBinding>,
}

impl RouteTable {
    /// Derive bindings from the HTTP annotations of a service.
    ///
    /// Fails on malformed templates and on two procedures claiming the same
    /// method and template.
    pub fn from_service(service: &ServiceDefinition) -> Result<Self> {
        let mut bindings: Vec<RouteBinding> = Vec::new();
        for procedure in &service.procedures {
            for rule in &procedure.http {
                let template = PathTemplate::parse(&rule.path)?;
                if let Some(existing) = bindings
                    .iter()
                    .find(|b| b.method == rule.method && b.template == template)
                {
                    return Err(TwinportError::Config {
                        message: format!(
                            "{} {} is bound to both {} and {}",
                            rule.method, rule.path, existing.procedure, procedure.name
                        ),
                    });
                }
                bindings.push(RouteBinding {
                    method: rule.method.clone(),
                    template,
                    procedure: procedure.name.clone(),
                    body: rule.body,
                    transcoder: procedure.transcoder.clone(),
                });
            }
        }

        // More specific templates win when several match.
        bindings.sort_by(|a, b| b.template.literal_count().cmp(&a.template.literal_count()));
        Ok(Self { bindings })
    }

    /// Find the binding for a method and path.
    pub fn resolve(&self, method: &Method, path: &str) -> Result<RouteMatch<'_>> {
        self.bindings
            .iter()
            .filter(|b| &b.method == method)
            .find_map(|binding| {
                binding
                    .template
                    .matches(path)
                    .map(|captures| RouteMatch { binding, captures })
            })
            .ok_or_else(|| TwinportError::RouteNotFound {
                method: method.to_string(),
                path: path.to_string(),
            })
    }

    pub fn bindings(&self) -> &[RouteBinding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::greeter::{self, SayHelloRequest, SayHelloResponse};
    use crate::service::HttpRule;

    #[test]
    fn test_template_parse_errors() {
        assert!(PathTemplate::parse("v1/x").is_err());
        assert!(PathTemplate::parse("/v1//x").is_err());
        assert!(PathTemplate::parse("/v1/{name").is_err());
        assert!(PathTemplate::parse("/v1/{}").is_err());
        assert!(PathTemplate::parse("/v1/a{b}").is_err());
        assert!(PathTemplate::parse("/v1/{name}").is_ok());
    }

    #[test]
    fn test_template_matching() {
        let template = PathTemplate::parse("/v1/sayhi/{name}").unwrap();
        assert_eq!(
            template.matches("/v1/sayhi/Ada"),
            Some(vec![("name".to_string(), "Ada".to_string())])
        );
        assert_eq!(
            template.matches("/v1/sayhi/Ada%20Lovelace/"),
            Some(vec![("name".to_string(), "Ada Lovelace".to_string())])
        );
        assert_eq!(template.matches("/v1/sayhi"), None);
        assert_eq!(template.matches("/v1/sayhi/a/b"), None);
        assert_eq!(template.matches("/v2/sayhi/Ada"), None);
    }

    #[test]
    fn test_resolve_greeter_routes() {
        let table = RouteTable::from_service(&greeter::service_definition()).unwrap();
        assert_eq!(table.len(), 3);

        let hello = table.resolve(&Method::POST, "/v1/sayhello").unwrap();
        assert_eq!(hello.binding.procedure, greeter::SAY_HELLO);
        assert!(hello.captures.is_empty());

        let hi = table.resolve(&Method::GET, "/v1/sayhi/Grace").unwrap();
        assert_eq!(hi.binding.procedure, greeter::SAY_HI);
        assert_eq!(hi.binding.body, BodyRule::Empty);
        assert_eq!(hi.captures, vec![("name".to_string(), "Grace".to_string())]);
    }

    #[test]
    fn test_resolve_unknown_is_not_found() {
        let table = RouteTable::from_service(&greeter::service_definition()).unwrap();

        let err = table.resolve(&Method::POST, "/v1/unknown").unwrap_err();
        assert!(matches!(err, TwinportError::RouteNotFound { .. }));

        // Right path, wrong method.
        let err = table.resolve(&Method::GET, "/v1/sayhello").unwrap_err();
        assert!(matches!(err, TwinportError::RouteNotFound { .. }));
    }

    #[test]
    fn test_literal_route_preferred_over_field() {
        let service = ServiceDefinition::new("test.Svc")
            .procedure::<SayHelloRequest, SayHelloResponse>("ByName", vec![HttpRule::get("/v1/items/{name}")])
            .procedure::<SayHelloRequest, SayHelloResponse>("Latest", vec![HttpRule::get("/v1/items/latest")]);
        let table = RouteTable::from_service(&service).unwrap();

        let latest = table.resolve(&Method::GET, "/v1/items/latest").unwrap();
        assert_eq!(latest.binding.procedure, "/test.Svc/Latest");
        let other = table.resolve(&Method::GET, "/v1/items/other").unwrap();
        assert_eq!(other.binding.procedure, "/test.Svc/ByName");
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let service = ServiceDefinition::new("test.Svc")
            .procedure::<SayHelloRequest, SayHelloResponse>("A", vec![HttpRule::post("/v1/x")])
            .procedure::<SayHelloRequest, SayHelloResponse>("B", vec![HttpRule::post("/v1/x")]);
        assert!(matches!(
            RouteTable::from_service(&service),
            Err(TwinportError::Config { .. })
        ));
    }
}
