//! # Request/Reply Dispatch
//!
//! Control messages whose subtopic starts with a method name are requests:
//!
//! ```text
//! $EDC/ACC/<device>/<appId>/GET/a/b        request.id, requester.client.id
//!                           │    └─ resource path [a, b]
//!                           └─ method
//!
//! $EDC/ACC/<requester>/<appId>/REPLY/<request.id>   response.code (+ exception)
//! ```
//!
//! Requests run on a small worker pool. Every dispatched request produces
//! exactly one reply publish, whatever the handler does.

pub mod worker;

pub use worker::WorkerPool;

use crate::client::listener::panic_message;
use crate::client::DEFAULT_PRIORITY;
use crate::payload::{MetricValue, Payload};
use crate::router::CloudContext;
use crate::topic::ApplicationTopic;
use crate::transport::Qos;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const METRIC_REQUEST_ID: &str = "request.id";
pub const METRIC_REQUESTER_CLIENT_ID: &str = "requester.client.id";
pub const METRIC_RESPONSE_CODE: &str = "response.code";
pub const METRIC_EXCEPTION_MESSAGE: &str = "response.exception.message";

/// Subtopic segment marking replies
pub const REPLY: &str = "REPLY";

/// RPC verb, taken from the first subtopic segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Del,
    Exec,
}

impl FromStr for Method {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "PUT" => Ok(Method::Put),
            "POST" => Ok(Method::Post),
            "DEL" => Ok(Method::Del),
            "EXEC" => Ok(Method::Exec),
            other => Err(ParseError::UnknownMethod(other.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Del => "DEL",
            Method::Exec => "EXEC",
        };
        write!(f, "{}", name)
    }
}

/// A control message that cannot be turned into a request
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Request has no method segment")]
    MissingMethod,

    #[error("Unknown request method '{0}'")]
    UnknownMethod(String),

    #[error("Request is missing the '{0}' metric")]
    MissingMetric(&'static str),
}

/// Failure reported by a [`RequestHandler`]
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn response_code(&self) -> ResponseCode {
        match self {
            HandlerError::BadRequest(_) => ResponseCode::BadRequest,
            HandlerError::NotFound(_) => ResponseCode::NotFound,
            HandlerError::Internal(_) | HandlerError::Other(_) => ResponseCode::InternalError,
        }
    }
}

/// Value of the `response.code` metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok = 200,
    BadRequest = 400,
    NotFound = 404,
    InternalError = 500,
}

impl ResponseCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Correlation data for one request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub request_id: String,
    pub requester_client_id: String,
    pub method: Method,
    pub resource_path: Vec<String>,
    /// Device the request was addressed to
    pub device_id: String,
    pub application_id: String,
}

impl RequestContext {
    /// Builds the context from a decoded control topic and its payload
    pub fn parse(
        topic: &ApplicationTopic,
        payload: &Payload,
        separator: &str,
    ) -> Result<Self, ParseError> {
        let mut segments = topic.application_topic().split(separator);
        let method = match segments.next() {
            Some(segment) if !segment.is_empty() => segment.parse::<Method>()?,
            _ => return Err(ParseError::MissingMethod),
        };
        let resource_path = segments.map(str::to_string).collect();

        Ok(Self {
            request_id: required_string(payload, METRIC_REQUEST_ID)?,
            requester_client_id: required_string(payload, METRIC_REQUESTER_CLIENT_ID)?,
            method,
            resource_path,
            device_id: topic.device_id.clone(),
            application_id: topic.application_id.clone(),
        })
    }
}

fn required_string(payload: &Payload, name: &'static str) -> Result<String, ParseError> {
    match payload.metric(name) {
        Some(MetricValue::String(value)) if !value.is_empty() => Ok(value.clone()),
        _ => Err(ParseError::MissingMetric(name)),
    }
}

/// Application-side request handler
///
/// Unimplemented methods answer 404.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn do_get(
        &self,
        context: &RequestContext,
        _request: &Payload,
    ) -> Result<Payload, HandlerError> {
        Err(not_supported(context))
    }

    async fn do_put(
        &self,
        context: &RequestContext,
        _request: &Payload,
    ) -> Result<Payload, HandlerError> {
        Err(not_supported(context))
    }

    async fn do_post(
        &self,
        context: &RequestContext,
        _request: &Payload,
    ) -> Result<Payload, HandlerError> {
        Err(not_supported(context))
    }

    async fn do_del(
        &self,
        context: &RequestContext,
        _request: &Payload,
    ) -> Result<Payload, HandlerError> {
        Err(not_supported(context))
    }

    async fn do_exec(
        &self,
        context: &RequestContext,
        _request: &Payload,
    ) -> Result<Payload, HandlerError> {
        Err(not_supported(context))
    }
}

fn not_supported(context: &RequestContext) -> HandlerError {
    HandlerError::NotFound(format!(
        "{} {} is not supported",
        context.method,
        context.resource_path.join("/")
    ))
}

async fn call_handler(
    handler: &dyn RequestHandler,
    context: &RequestContext,
    request: &Payload,
) -> Result<Payload, HandlerError> {
    match context.method {
        Method::Get => handler.do_get(context, request).await,
        Method::Put => handler.do_put(context, request).await,
        Method::Post => handler.do_post(context, request).await,
        Method::Del => handler.do_del(context, request).await,
        Method::Exec => handler.do_exec(context, request).await,
    }
}

/// Routes control requests to the handler registered for their application
pub struct RequestDispatcher {
    context: Arc<CloudContext>,
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    pool: WorkerPool,
}

impl RequestDispatcher {
    pub fn new(context: Arc<CloudContext>) -> Self {
        let workers = context.options.dispatcher.workers;
        Self {
            context,
            handlers: RwLock::new(HashMap::new()),
            pool: WorkerPool::new(workers),
        }
    }

    pub fn register_handler(&self, application_id: &str, handler: Arc<dyn RequestHandler>) {
        info!("Registering request handler for {}", application_id);
        self.handlers
            .write()
            .insert(application_id.to_string(), handler);
    }

    pub fn unregister_handler(&self, application_id: &str) -> bool {
        self.handlers.write().remove(application_id).is_some()
    }

    pub fn handler(&self, application_id: &str) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.read().get(application_id).cloned()
    }

    pub fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the topic is itself a reply (`<appId>/REPLY...`).
    ///
    /// This is a plain prefix test, so `REPLYX` also counts.
    pub fn is_reply(&self, topic: &ApplicationTopic) -> bool {
        let separator = self.context.topics.separator();
        let prefix = format!("{}{}{}", topic.application_id, separator, REPLY);
        topic.full_application_topic(separator).starts_with(&prefix)
    }

    /// Queues a request on the worker pool.
    ///
    /// Returns false if no handler is registered or the pool is closed.
    pub fn submit(&self, topic: ApplicationTopic, payload: Payload) -> bool {
        let Some(handler) = self.handler(&topic.application_id) else {
            debug!(
                "No request handler for {}, not dispatching",
                topic.application_id
            );
            return false;
        };
        let context = self.context.clone();
        self.pool.submit(async move {
            dispatch(context, handler, topic, payload).await;
        })
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Runs one request to completion and publishes its reply.
///
/// Returns the reply payload; publish failures are logged only.
pub async fn dispatch(
    context: Arc<CloudContext>,
    handler: Arc<dyn RequestHandler>,
    topic: ApplicationTopic,
    request: Payload,
) -> Payload {
    let separator = context.topics.separator().to_string();
    let (reply, reply_device, reply_subtopic) =
        match RequestContext::parse(&topic, &request, &separator) {
            Ok(request_context) => {
                debug!(
                    "Dispatching {} {:?} #{} to {}",
                    request_context.method,
                    request_context.resource_path,
                    request_context.request_id,
                    request_context.application_id
                );
                let reply = run_handler(handler, request_context.clone(), request).await;
                let subtopic = format!("{}{}{}", REPLY, separator, request_context.request_id);
                (reply, request_context.requester_client_id, subtopic)
            }
            Err(e) => {
                warn!("Rejecting request on {}: {}", topic.full_application_topic(&separator), e);
                let reply = failure(ResponseCode::BadRequest, &e.to_string());
                (reply, topic.device_id.clone(), REPLY.to_string())
            }
        };

    let reply_topic =
        context
            .topics
            .encode(&topic.application_id, &reply_device, &reply_subtopic, true);
    match context.codec.encode(&reply) {
        Ok(bytes) => {
            if let Err(e) = context
                .transport
                .publish(&reply_topic, bytes, Qos::AtMostOnce, false, DEFAULT_PRIORITY)
                .await
            {
                error!("Failed to publish reply on {}: {}", reply_topic, e);
            }
        }
        Err(e) => error!("Failed to encode reply for {}: {}", reply_topic, e),
    }
    reply
}

async fn run_handler(
    handler: Arc<dyn RequestHandler>,
    request_context: RequestContext,
    request: Payload,
) -> Payload {
    let outcome = tokio::spawn(async move {
        call_handler(handler.as_ref(), &request_context, &request).await
    })
    .await;

    match outcome {
        Ok(Ok(mut reply)) => {
            if reply.timestamp.is_none() {
                reply.timestamp = Some(Utc::now());
            }
            reply.add_metric(METRIC_RESPONSE_CODE, ResponseCode::Ok.as_i32());
            reply
        }
        Ok(Err(e)) => {
            warn!("Request handler failed: {}", e);
            failure(e.response_code(), &e.to_string())
        }
        Err(join_error) => {
            let message = if join_error.is_panic() {
                panic_message(&*join_error.into_panic())
            } else {
                join_error.to_string()
            };
            error!("Request handler panicked: {}", message);
            failure(ResponseCode::InternalError, &message)
        }
    }
}

fn failure(code: ResponseCode, message: &str) -> Payload {
    let mut reply = Payload::new().with_timestamp(Utc::now());
    reply.add_metric(METRIC_RESPONSE_CODE, code.as_i32());
    let message = if message.is_empty() {
        "request failed"
    } else {
        message
    };
    reply.add_metric(METRIC_EXCEPTION_MESSAGE, message);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_topic(subtopic: &str) -> ApplicationTopic {
        ApplicationTopic {
            control_prefix: Some("$EDC".to_string()),
            account_token: "ACC".to_string(),
            device_id: "D1".to_string(),
            application_id: "APP".to_string(),
            subtopic: Some(subtopic.to_string()),
        }
    }

    fn request() -> Payload {
        let mut payload = Payload::new();
        payload.add_metric(METRIC_REQUEST_ID, "r-1");
        payload.add_metric(METRIC_REQUESTER_CLIENT_ID, "console");
        payload
    }

    #[test]
    fn parses_method_and_resource_path() {
        let context = RequestContext::parse(&control_topic("EXEC/a/b"), &request(), "/")
            .expect("valid request");
        assert_eq!(context.method, Method::Exec);
        assert_eq!(context.resource_path, vec!["a", "b"]);
        assert_eq!(context.request_id, "r-1");
        assert_eq!(context.requester_client_id, "console");
    }

    #[test]
    fn rejects_unknown_method() {
        let err = RequestContext::parse(&control_topic("FETCH/x"), &request(), "/").unwrap_err();
        assert_eq!(err, ParseError::UnknownMethod("FETCH".to_string()));
    }

    #[test]
    fn rejects_missing_correlation() {
        let mut payload = request();
        payload.remove_metric(METRIC_REQUESTER_CLIENT_ID);
        let err = RequestContext::parse(&control_topic("GET"), &payload, "/").unwrap_err();
        assert_eq!(err, ParseError::MissingMetric(METRIC_REQUESTER_CLIENT_ID));
    }

    #[test]
    fn rejects_empty_subtopic() {
        let mut topic = control_topic("");
        topic.subtopic = None;
        let err = RequestContext::parse(&topic, &request(), "/").unwrap_err();
        assert_eq!(err, ParseError::MissingMethod);
    }

    #[test]
    fn handler_errors_map_to_codes() {
        assert_eq!(
            HandlerError::BadRequest("x".into()).response_code(),
            ResponseCode::BadRequest
        );
        assert_eq!(
            HandlerError::NotFound("x".into()).response_code(),
            ResponseCode::NotFound
        );
        let other: Box<dyn std::error::Error + Send + Sync> = "boom".into();
        assert_eq!(
            HandlerError::from(other).response_code(),
            ResponseCode::InternalError
        );
    }

    #[test]
    fn failure_reply_always_has_a_message() {
        let reply = failure(ResponseCode::InternalError, "");
        assert_eq!(
            reply.metric(METRIC_RESPONSE_CODE),
            Some(&MetricValue::Int32(500))
        );
        assert_eq!(
            reply.metric(METRIC_EXCEPTION_MESSAGE),
            Some(&MetricValue::from("request failed"))
        );
    }
}
