//! Route generation from queue mapping blocks.
//!
//! Everything is validated here, before a single route is registered:
//! argument type names, write-operation names against the resolved handler,
//! and path uniqueness.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::auth::{GETTER, SETTER};
use crate::domain::{MappingEntry, QueueDefinition};
use crate::handlers::OperationArgs;
use crate::ingest::IngestionSubsystem;

pub const HEALTH_PATH: &str = "/healthz";
pub const LIST_CATEGORIES_PATH: &str = "/raw/_listcategories";
pub const LIST_ENTRIES_PATH: &str = "/raw/_entries/{category}";
pub const RAW_ENTRY_PATH: &str = "/raw/_entry/{category}/{entry}";
pub const LIST_ROUTES_PATH: &str = "/raw/_routes";

const RESERVED_PREFIXES: [&str; 2] = ["/raw/_entries/", "/raw/_entry/"];

/// Scalar kinds a write-operation argument may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    String,
    Integer,
    Boolean,
    Float,
}

impl ArgKind {
    /// Resolve a configured type name, ignoring case.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "string" | "str" => Some(Self::String),
            "integer" | "int" => Some(Self::Integer),
            "boolean" | "bool" => Some(Self::Boolean),
            "float" | "number" => Some(Self::Float),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Float => "float",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Float => value.is_number(),
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write half of a route: which handler operation to call and with what shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteRoute {
    pub operation: String,
    pub args: BTreeMap<String, ArgKind>,
}

/// One generated endpoint, captured by value and attached to its route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDescriptor {
    pub path: String,
    pub queue_id: String,
    pub entry_key: String,
    pub description: String,
    /// Role required in addition to the getter/setter capability.
    pub required_role: Option<String>,
    pub write: Option<WriteRoute>,
}

impl RouteDescriptor {
    /// Roles a caller needs to read this route.
    pub fn read_roles(&self) -> Vec<&str> {
        self.roles_with(GETTER)
    }

    /// Roles a caller needs to invoke this route's write-operation.
    pub fn write_roles(&self) -> Vec<&str> {
        self.roles_with(SETTER)
    }

    fn roles_with<'a>(&'a self, capability: &'a str) -> Vec<&'a str> {
        let mut roles = vec![capability];
        if let Some(role) = self.required_role.as_deref() {
            roles.push(role);
        }
        roles
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("`{path}`: argument `{arg}` has unknown type `{type_name}`")]
    UnknownArgType {
        path: String,
        arg: String,
        type_name: String,
    },
    #[error("`{path}`: post is enabled but no handlermethod is declared")]
    MissingOperation { path: String },
    #[error("`{path}`: handler `{handler}` of queue `{queue}` has no operation `{operation}`")]
    UnsupportedOperation {
        path: String,
        queue: String,
        handler: String,
        operation: String,
    },
    #[error("`{path}`: operation `{operation}` reads {expected:?} but declares {declared:?}")]
    ArgumentMismatch {
        path: String,
        operation: String,
        expected: Vec<String>,
        declared: Vec<String>,
    },
    #[error("`{path}` is generated more than once or collides with a built-in endpoint")]
    DuplicatePath { path: String },
    #[error("`{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BodyError {
    #[error("body must be a JSON object")]
    NotAnObject,
    #[error("missing argument `{0}`")]
    Missing(String),
    #[error("unexpected argument `{0}`")]
    Unexpected(String),
    #[error("argument `{name}` must be a {expected}")]
    WrongKind { name: String, expected: ArgKind },
}

/// Validate every mapping entry of every queue and produce its route.
pub fn build_routes(
    queues: &[QueueDefinition],
    ingestion: &IngestionSubsystem,
) -> Result<Vec<RouteDescriptor>, SurfaceError> {
    let mut seen = BTreeSet::new();
    let mut routes = Vec::new();

    for queue in queues {
        let Some(mapping) = queue.mapping.as_ref() else {
            continue;
        };
        for entry in &mapping.map {
            let path = join_path(&mapping.base, &entry.to)?;
            if is_reserved(&path) || !seen.insert(path.clone()) {
                return Err(SurfaceError::DuplicatePath { path });
            }
            let write = write_route(queue, entry, &path, ingestion)?;
            debug!(
                path = %path,
                queue = %queue.id,
                entry = %entry.from,
                writable = write.is_some(),
                "Route generated"
            );
            routes.push(RouteDescriptor {
                path,
                queue_id: queue.id.clone(),
                entry_key: entry.from.clone(),
                description: entry.description.clone(),
                required_role: entry.role.clone().filter(|role| !role.is_empty()),
                write,
            });
        }
    }
    Ok(routes)
}

fn write_route(
    queue: &QueueDefinition,
    entry: &MappingEntry,
    path: &str,
    ingestion: &IngestionSubsystem,
) -> Result<Option<WriteRoute>, SurfaceError> {
    if !entry.is_writable() {
        return Ok(None);
    }
    let method = entry
        .handler_method
        .as_ref()
        .ok_or_else(|| SurfaceError::MissingOperation {
            path: path.to_string(),
        })?;

    let mut args = BTreeMap::new();
    for (name, type_name) in &method.args {
        let kind = ArgKind::parse(type_name).ok_or_else(|| SurfaceError::UnknownArgType {
            path: path.to_string(),
            arg: name.clone(),
            type_name: type_name.clone(),
        })?;
        args.insert(name.clone(), kind);
    }

    let handler = ingestion.resolve_handler(&queue.id);
    let Some(operation) = handler.operation(&method.name) else {
        return Err(SurfaceError::UnsupportedOperation {
            path: path.to_string(),
            queue: queue.id.clone(),
            handler: handler.kind().to_string(),
            operation: method.name.clone(),
        });
    };

    let expected: BTreeSet<&str> = operation.args.iter().copied().collect();
    let declared: BTreeSet<&str> = args.keys().map(String::as_str).collect();
    if expected != declared {
        return Err(SurfaceError::ArgumentMismatch {
            path: path.to_string(),
            operation: method.name.clone(),
            expected: expected.into_iter().map(str::to_string).collect(),
            declared: declared.into_iter().map(str::to_string).collect(),
        });
    }

    Ok(Some(WriteRoute {
        operation: method.name.clone(),
        args,
    }))
}

fn join_path(base: &str, to: &str) -> Result<String, SurfaceError> {
    let base = base.trim().trim_end_matches('/');
    let to = to.trim().trim_matches('/');
    let path = format!("{}{base}/{to}", if base.starts_with('/') { "" } else { "/" });
    if to.is_empty() {
        return Err(SurfaceError::InvalidPath {
            path,
            reason: "mapping entry has an empty `to`",
        });
    }
    if path.contains(['{', '}', '*']) {
        return Err(SurfaceError::InvalidPath {
            path,
            reason: "path segments may not contain `{`, `}` or `*`",
        });
    }
    if path.split('/').any(|segment| segment.starts_with(':')) {
        return Err(SurfaceError::InvalidPath {
            path,
            reason: "path segments may not start with `:`",
        });
    }
    Ok(path)
}

fn is_reserved(path: &str) -> bool {
    path == HEALTH_PATH
        || path == LIST_CATEGORIES_PATH
        || path == LIST_ROUTES_PATH
        || RESERVED_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Check a write body against the declared shape and return it as arguments.
///
/// The key set must equal the declared argument names exactly.
pub fn validate_body(route: &WriteRoute, body: Value) -> Result<OperationArgs, BodyError> {
    let Value::Object(fields) = body else {
        return Err(BodyError::NotAnObject);
    };
    if let Some(extra) = fields.keys().find(|key| !route.args.contains_key(*key)) {
        return Err(BodyError::Unexpected(extra.clone()));
    }
    for (name, kind) in &route.args {
        let value = fields
            .get(name)
            .ok_or_else(|| BodyError::Missing(name.clone()))?;
        if !kind.matches(value) {
            return Err(BodyError::WrongKind {
                name: name.clone(),
                expected: *kind,
            });
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::cache::MemoryStore;
    use crate::domain::{MappingBlock, WriteOperationSpec};
    use crate::ingest::IngestOptions;

    fn read_entry(to: &str, from: &str) -> MappingEntry {
        MappingEntry {
            to: to.to_string(),
            from: from.to_string(),
            description: format!("{from} reading"),
            post: false,
            role: None,
            handler_method: None,
        }
    }

    fn write_entry(to: &str, operation: &str, args: &[(&str, &str)]) -> MappingEntry {
        MappingEntry {
            post: true,
            handler_method: Some(WriteOperationSpec {
                name: operation.to_string(),
                args: args
                    .iter()
                    .map(|(name, kind)| (name.to_string(), kind.to_string()))
                    .collect(),
            }),
            ..read_entry(to, "active")
        }
    }

    fn queue(id: &str, handler: &str, base: &str, map: Vec<MappingEntry>) -> QueueDefinition {
        QueueDefinition::new(id, handler).with_mapping(MappingBlock {
            base: base.to_string(),
            map,
        })
    }

    fn routes(queues: Vec<QueueDefinition>) -> Result<Vec<RouteDescriptor>, SurfaceError> {
        let (store, _worker) = MemoryStore::spawn();
        let ingestion = IngestionSubsystem::new(
            queues.clone(),
            store,
            Arc::new(MemoryBroker::new()),
            IngestOptions::default(),
        );
        build_routes(&queues, &ingestion)
    }

    #[test]
    fn arg_kinds_resolve_case_insensitively() {
        assert_eq!(ArgKind::parse("Boolean"), Some(ArgKind::Boolean));
        assert_eq!(ArgKind::parse("STR"), Some(ArgKind::String));
        assert_eq!(ArgKind::parse("int"), Some(ArgKind::Integer));
        assert_eq!(ArgKind::parse("number"), Some(ArgKind::Float));
        assert_eq!(ArgKind::parse("datetime"), None);
    }

    #[test]
    fn arg_kinds_match_json_values() {
        assert!(ArgKind::Integer.matches(&json!(3)));
        assert!(!ArgKind::Integer.matches(&json!(3.5)));
        assert!(ArgKind::Float.matches(&json!(3)));
        assert!(ArgKind::Boolean.matches(&json!(false)));
        assert!(!ArgKind::String.matches(&json!(1)));
    }

    #[test]
    fn joins_base_and_entry() {
        assert_eq!(join_path("/raw", "temp1").expect("path"), "/raw/temp1");
        assert_eq!(join_path("raw/", "/temp1").expect("path"), "/raw/temp1");
        assert_eq!(join_path("", "temp1").expect("path"), "/temp1");
        assert!(join_path("/raw", "").is_err());
        assert!(join_path("/raw", "{id}").is_err());
        assert!(join_path("/raw", ":state").is_err());
        assert!(join_path("/:leds", "active").is_err());
        assert_eq!(join_path("/raw", "a:b").expect("path"), "/raw/a:b");
    }

    #[tokio::test]
    async fn generates_read_and_write_routes() {
        let generated = routes(vec![
            queue("sensors", "senml", "/raw", vec![read_entry("temp1", "temp1")]),
            queue(
                "leds",
                "command",
                "/leds",
                vec![write_entry("active", "set_active_state", &[("active", "Boolean")])],
            ),
        ])
        .expect("valid surface");

        assert_eq!(generated.len(), 2);
        assert_eq!(generated[0].path, "/raw/temp1");
        assert_eq!(generated[0].queue_id, "sensors");
        assert!(generated[0].write.is_none());
        assert_eq!(generated[0].read_roles(), vec!["getter"]);

        let write = generated[1].write.as_ref().expect("write route");
        assert_eq!(write.operation, "set_active_state");
        assert_eq!(write.args.get("active"), Some(&ArgKind::Boolean));
        assert_eq!(generated[1].write_roles(), vec!["setter"]);
    }

    #[tokio::test]
    async fn queues_without_mapping_generate_nothing() {
        let generated = routes(vec![QueueDefinition::new("sensors", "senml")]).expect("valid");
        assert!(generated.is_empty());
    }

    #[tokio::test]
    async fn unknown_argument_type_is_fatal() {
        let err = routes(vec![queue(
            "leds",
            "command",
            "/leds",
            vec![write_entry("active", "set_active_state", &[("active", "datetime")])],
        )])
        .expect_err("unknown type");
        assert!(matches!(
            err,
            SurfaceError::UnknownArgType { ref type_name, .. } if type_name == "datetime"
        ));
    }

    #[tokio::test]
    async fn operation_must_exist_on_handler() {
        let err = routes(vec![queue(
            "env",
            "senml",
            "/env",
            vec![write_entry("active", "set_active_state", &[("active", "bool")])],
        )])
        .expect_err("senml exposes no operations");
        assert!(matches!(err, SurfaceError::UnsupportedOperation { .. }));
    }

    #[tokio::test]
    async fn declared_arguments_must_match_operation() {
        for args in [
            vec![("state", "bool")],
            vec![],
            vec![("active", "bool"), ("brightness", "int")],
        ] {
            let err = routes(vec![queue(
                "leds",
                "command",
                "/leds",
                vec![write_entry("active", "set_active_state", &args)],
            )])
            .expect_err("argument names differ from what the operation reads");
            let SurfaceError::ArgumentMismatch { expected, .. } = err else {
                panic!("expected an argument mismatch for {args:?}, got {err:?}");
            };
            assert_eq!(expected, vec!["active".to_string()]);
        }
    }

    #[tokio::test]
    async fn post_without_handlermethod_is_fatal() {
        let mut entry = read_entry("active", "active");
        entry.post = true;
        let err =
            routes(vec![queue("leds", "command", "/leds", vec![entry])]).expect_err("missing");
        assert!(matches!(err, SurfaceError::MissingOperation { .. }));
    }

    #[tokio::test]
    async fn duplicate_and_reserved_paths_are_fatal() {
        let err = routes(vec![
            queue("a", "senml", "/raw", vec![read_entry("temp", "t")]),
            queue("b", "senml", "/raw/", vec![read_entry("temp", "t")]),
        ])
        .expect_err("duplicate");
        assert_eq!(
            err,
            SurfaceError::DuplicatePath {
                path: "/raw/temp".to_string()
            }
        );

        let err = routes(vec![queue(
            "a",
            "senml",
            "/raw",
            vec![read_entry("_listcategories", "t")],
        )])
        .expect_err("reserved");
        assert!(matches!(err, SurfaceError::DuplicatePath { .. }));

        let err = routes(vec![queue(
            "a",
            "senml",
            "/raw",
            vec![read_entry("_routes", "t")],
        )])
        .expect_err("reserved");
        assert!(matches!(err, SurfaceError::DuplicatePath { .. }));
    }

    #[test]
    fn body_must_match_declared_shape_exactly() {
        let route = WriteRoute {
            operation: "set_active_state".to_string(),
            args: [("active".to_string(), ArgKind::Boolean)].into(),
        };

        let args = validate_body(&route, json!({"active": true})).expect("valid body");
        assert_eq!(args.get("active"), Some(&json!(true)));

        assert_eq!(validate_body(&route, json!([true])), Err(BodyError::NotAnObject));
        assert_eq!(
            validate_body(&route, json!({})),
            Err(BodyError::Missing("active".to_string()))
        );
        assert_eq!(
            validate_body(&route, json!({"active": true, "extra": 1})),
            Err(BodyError::Unexpected("extra".to_string()))
        );
        assert!(matches!(
            validate_body(&route, json!({"active": "yes"})),
            Err(BodyError::WrongKind { .. })
        ));
    }
}
