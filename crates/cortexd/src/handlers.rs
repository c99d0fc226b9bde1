//! RPC method handlers.
//!
//! Methods are looked up by name in a `HandlerTable`. Each handler takes
//! the decoded request and returns a JSON result or a `HandlerError` that
//! maps onto a protocol error code.

use std::collections::HashMap;
use std::sync::Arc;

use cortex_common::alert::{AlertCategory, AlertFilter, AlertSeverity, AlertStatus};
use cortex_common::health::HealthSnapshot;
use cortex_common::protocol::{methods, ErrorCode, Request};
use serde_json::{json, Value};
use tracing::info;

use crate::daemon::DaemonContext;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidParams(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::InvalidParams(_) => ErrorCode::InvalidParams,
            HandlerError::Config(_) => ErrorCode::ConfigError,
            HandlerError::Unavailable(_) => ErrorCode::ResourceUnavailable,
            HandlerError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

pub type Handler = Box<dyn Fn(&Request) -> HandlerResult + Send + Sync>;

/// Method name -> handler
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `method`
    pub fn register<F>(&mut self, method: &str, handler: F)
    where
        F: Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.insert(method.to_string(), Box::new(handler));
    }

    pub fn get(&self, method: &str) -> Option<&Handler> {
        self.handlers.get(method)
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Every daemon method, bound to the shared context
pub fn build_table(ctx: Arc<DaemonContext>) -> HandlerTable {
    let mut table = HandlerTable::new();

    table.register(methods::PING, |_| Ok(json!({"pong": true})));

    table.register(methods::VERSION, |_| {
        Ok(json!({"version": cortex_common::VERSION, "name": cortex_common::NAME}))
    });

    let c = ctx.clone();
    table.register(methods::CONFIG_GET, move |_| {
        serde_json::to_value(&*c.config.get()).map_err(|e| HandlerError::Internal(e.to_string()))
    });

    let c = ctx.clone();
    table.register(methods::CONFIG_RELOAD, move |_| match c.reload_config() {
        Ok(_) => Ok(json!({"reloaded": true})),
        Err(e) => Err(HandlerError::Config(format!(
            "Failed to reload configuration: {}",
            e
        ))),
    });

    let c = ctx.clone();
    table.register(methods::SHUTDOWN, move |_| {
        info!("[IPC] Shutdown requested by client");
        c.shutdown.request();
        Ok(json!({"shutdown": "initiated"}))
    });

    let c = ctx.clone();
    table.register(methods::HEALTH, move |_| snapshot_value(&c));

    let c = ctx.clone();
    table.register(methods::HEALTH_CHECK, move |_| {
        c.monitor.trigger_check();
        snapshot_value(&c)
    });

    let c = ctx.clone();
    table.register(methods::ALERTS, move |req| {
        let filter = parse_filter(req)?;
        let alerts = c
            .alerts
            .list(&filter)
            .map_err(|e| HandlerError::Unavailable(format!("Alert store unavailable: {}", e)))?;
        let count = alerts.len();
        Ok(json!({"alerts": alerts, "count": count}))
    });

    let c = ctx.clone();
    table.register(methods::ALERTS_COUNTS, move |_| {
        let counts = c.alerts.counts();
        let open = c.alerts.open_counts();
        Ok(json!({
            "info": counts.info,
            "warning": counts.warning,
            "error": counts.error,
            "critical": counts.critical,
            "total": counts.total,
            "active": open.active,
            "acknowledged": open.acknowledged,
        }))
    });

    let c = ctx.clone();
    table.register(methods::ALERTS_ACKNOWLEDGE, move |req| {
        match target(req)? {
            Target::All => Ok(json!({"acknowledged": c.alerts.acknowledge_all()})),
            Target::One(id) => Ok(json!({"acknowledged": c.alerts.acknowledge(&id), "id": id})),
        }
    });

    let c = ctx;
    table.register(methods::ALERTS_DISMISS, move |req| match target(req)? {
        Target::All => Ok(json!({"dismissed": c.alerts.dismiss_all()})),
        Target::One(id) => Ok(json!({"dismissed": c.alerts.dismiss(&id), "id": id})),
    });

    table
}

/// Monitor snapshot with alert counts read live from the store
fn snapshot_value(ctx: &DaemonContext) -> HandlerResult {
    let mut snapshot: HealthSnapshot = ctx.monitor.snapshot();
    let open = ctx.alerts.open_counts();
    snapshot.active_alerts = open.active;
    snapshot.critical_alerts = open.critical;
    serde_json::to_value(&snapshot).map_err(|e| HandlerError::Internal(e.to_string()))
}

enum Target {
    All,
    One(String),
}

fn target(req: &Request) -> Result<Target, HandlerError> {
    match req.param("all") {
        Some(Value::Bool(true)) => return Ok(Target::All),
        Some(Value::Bool(false)) | None => {}
        Some(_) => return Err(HandlerError::InvalidParams("'all' must be a boolean".into())),
    }
    match req.param("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(Target::One(id.clone())),
        Some(_) => Err(HandlerError::InvalidParams("'id' must be a non-empty string".into())),
        None => Err(HandlerError::InvalidParams(
            "Missing 'id' or 'all' parameter".into(),
        )),
    }
}

fn string_param<'a>(req: &'a Request, key: &str) -> Result<Option<&'a str>, HandlerError> {
    match req.param(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(HandlerError::InvalidParams(format!("'{}' must be a string", key))),
    }
}

fn parse_filter(req: &Request) -> Result<AlertFilter, HandlerError> {
    let invalid = |e: cortex_common::alert::UnknownVariant| HandlerError::InvalidParams(e.to_string());

    let severity = string_param(req, "severity")?
        .map(str::parse::<AlertSeverity>)
        .transpose()
        .map_err(invalid)?;
    let category = string_param(req, "category")?
        .map(str::parse::<AlertCategory>)
        .transpose()
        .map_err(invalid)?;
    let status = string_param(req, "status")?
        .map(str::parse::<AlertStatus>)
        .transpose()
        .map_err(invalid)?;
    let source = string_param(req, "source")?.map(str::to_string);

    let include_dismissed = match req.param("include_dismissed") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            return Err(HandlerError::InvalidParams(
                "'include_dismissed' must be a boolean".into(),
            ))
        }
    };

    let limit = match req.param("limit") {
        None => None,
        Some(v) => Some(v.as_u64().ok_or_else(|| {
            HandlerError::InvalidParams("'limit' must be a non-negative integer".into())
        })? as usize),
    };

    Ok(AlertFilter {
        severity,
        category,
        status,
        source,
        include_dismissed,
        limit,
    })
}
