//! Remote-callable methods with argument binding, soft time budgets and error
//! capture.
//!
//! A call arrives as an [`Event`] whose type names the method and whose
//! payload holds the arguments. The payload may be an `[args, kwargs]` pair, a
//! bare array of positional arguments, an object of keyword arguments, `null`
//! for no arguments, or a single scalar. Failures never propagate: they come
//! back from [`RpcMethodRegistry::execute`] as an [`Error`] the engine turns
//! into an [`RpcFault`] reply.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evsched_event::Event;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::context::Context;
use crate::error::{Error, FaultCode, Result, panic_message};

/// Soft time budget used when none is given.
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(1);

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcArgs {
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: Map<String, Value>,
}

impl RpcArgs {
    /// Positional-only arguments.
    #[must_use]
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// Keyword-only arguments.
    #[must_use]
    pub fn keyword(kwargs: Map<String, Value>) -> Self {
        Self {
            args: Vec::new(),
            kwargs,
        }
    }

    /// Split a call payload into arguments.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Self {
        match payload {
            Value::Null => Self::default(),
            Value::Array(items) => match items.as_slice() {
                [Value::Array(args), Value::Object(kwargs)] => Self {
                    args: args.clone(),
                    kwargs: kwargs.clone(),
                },
                _ => Self::positional(items.clone()),
            },
            Value::Object(kwargs) => Self::keyword(kwargs.clone()),
            scalar => Self::positional(vec![scalar.clone()]),
        }
    }

    /// Encode as the `[args, kwargs]` pair, which is never ambiguous.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        Value::Array(vec![
            Value::Array(self.args.clone()),
            Value::Object(self.kwargs.clone()),
        ])
    }

    /// Whether no arguments were given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Deserialize the arguments into `A`.
    ///
    /// Positional arguments bind as a sequence (a tuple or a struct in field
    /// order); a single positional argument also binds directly. Keyword
    /// arguments bind by name. Mixing both is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ArgumentError`] if the arguments do not fit `A`.
    pub fn bind<A: DeserializeOwned>(&self) -> std::result::Result<A, ArgumentError> {
        if !self.args.is_empty() && !self.kwargs.is_empty() {
            return Err(ArgumentError(
                "typed methods take positional or keyword arguments, not both".to_string(),
            ));
        }

        if !self.kwargs.is_empty() {
            return serde_json::from_value(Value::Object(self.kwargs.clone()))
                .map_err(|e| ArgumentError(e.to_string()));
        }

        match serde_json::from_value(Value::Array(self.args.clone())) {
            Ok(bound) => Ok(bound),
            Err(e) => match self.args.as_slice() {
                [] => serde_json::from_value(Value::Null).map_err(|_| ArgumentError(e.to_string())),
                [single] => {
                    serde_json::from_value(single.clone()).map_err(|_| ArgumentError(e.to_string()))
                }
                _ => Err(ArgumentError(e.to_string())),
            },
        }
    }
}

/// Arguments could not be bound to a method's parameters.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot bind arguments: {0}")]
pub struct ArgumentError(String);

/// Error descriptor sent back to a caller in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    /// Machine-readable reason
    pub code: FaultCode,
    /// Human-readable detail
    pub message: String,
}

impl RpcFault {
    /// Key the fault is stored under in a reply payload.
    pub const KEY: &'static str = "__error__";

    /// Wrap the fault as a reply payload.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert(
            Self::KEY.to_string(),
            serde_json::json!({ "code": self.code, "message": self.message }),
        );
        Value::Object(payload)
    }

    /// Read a fault out of a reply payload, if it carries one.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        payload
            .get(Self::KEY)
            .and_then(|fault| serde_json::from_value(fault.clone()).ok())
    }
}

impl From<&Error> for RpcFault {
    fn from(err: &Error) -> Self {
        let code = match err {
            Error::MethodNotFound { .. } => FaultCode::MethodNotFound,
            Error::RpcExecution { code, .. } => *code,
            _ => FaultCode::ExecutionFailed,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

/// Remote-callable method
///
/// Every method receives the shared [`Context`]; the typed adapters decide
/// whether the wrapped function sees it.
#[async_trait]
pub trait RpcMethod: Send + Sync + 'static {
    /// Run the method.
    async fn call(&self, ctx: Context, args: RpcArgs) -> anyhow::Result<Value>;
}

/// Adapts an async closure over raw arguments into an [`RpcMethod`].
pub struct FnMethod<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RpcMethod for FnMethod<F>
where
    F: Fn(Context, RpcArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: Context, args: RpcArgs) -> anyhow::Result<Value> {
        (self.f)(ctx, args).await
    }
}

/// Wrap an async closure taking the context and raw arguments.
pub const fn raw<F, Fut>(f: F) -> FnMethod<F>
where
    F: Fn(Context, RpcArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnMethod { f }
}

/// Synchronous method with typed arguments; see [`typed`].
///
/// Calls run on tokio's blocking pool, so a slow method does not hold up the
/// engine's loops.
pub struct Typed<F, A, R> {
    f: Arc<F>,
    _marker: PhantomData<fn(A) -> R>,
}

/// Wrap a function whose arguments bind to `A` and whose result serializes.
///
/// ```ignore
/// registry.register("add", rpc::typed(|(a, b): (i64, i64)| Ok(a + b)));
/// ```
pub fn typed<A, R, F>(f: F) -> Typed<F, A, R>
where
    F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    Typed {
        f: Arc::new(f),
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, A, R> RpcMethod for Typed<F, A, R>
where
    F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn call(&self, _ctx: Context, args: RpcArgs) -> anyhow::Result<Value> {
        let bound = args.bind::<A>()?;
        let f = Arc::clone(&self.f);
        let result = run_blocking(move || (*f)(bound)).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Synchronous, context-aware method with typed arguments; see
/// [`typed_with_context`].
pub struct TypedWithContext<F, A, R> {
    f: Arc<F>,
    _marker: PhantomData<fn(A) -> R>,
}

/// Like [`typed`], with the engine's context passed first.
pub fn typed_with_context<A, R, F>(f: F) -> TypedWithContext<F, A, R>
where
    F: Fn(&Context, A) -> anyhow::Result<R> + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    TypedWithContext {
        f: Arc::new(f),
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, A, R> RpcMethod for TypedWithContext<F, A, R>
where
    F: Fn(&Context, A) -> anyhow::Result<R> + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn call(&self, ctx: Context, args: RpcArgs) -> anyhow::Result<Value> {
        let bound = args.bind::<A>()?;
        let f = Arc::clone(&self.f);
        let result = run_blocking(move || (*f)(&ctx, bound)).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Run a synchronous method body on the blocking pool. A panic is resumed on
/// the calling task so [`RpcMethodRegistry::execute`] reports it.
async fn run_blocking<R, F>(f: F) -> anyhow::Result<R>
where
    F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    R: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(anyhow::anyhow!("blocking call did not complete: {e}")),
    }
}

struct Registration {
    method: Arc<dyn RpcMethod>,
    time_budget: Option<Duration>,
}

/// Maps method names to remote-callable methods.
pub struct RpcMethodRegistry {
    methods: HashMap<String, Registration>,
    default_budget: Duration,
}

impl Default for RpcMethodRegistry {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
            default_budget: DEFAULT_TIME_BUDGET,
        }
    }
}

impl Debug for RpcMethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMethodRegistry")
            .field("methods", &self.methods())
            .field("default_budget", &self.default_budget)
            .finish()
    }
}

impl RpcMethodRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` under `name` with the default time budget.
    pub fn register(&mut self, name: impl Into<String>, method: impl RpcMethod) -> &mut Self {
        self.insert(name.into(), Arc::new(method), None)
    }

    /// Register `method` under `name` with its own soft time budget.
    pub fn register_with_budget(
        &mut self,
        name: impl Into<String>,
        method: impl RpcMethod,
        time_budget: Duration,
    ) -> &mut Self {
        self.insert(name.into(), Arc::new(method), Some(time_budget))
    }

    fn insert(
        &mut self,
        name: String,
        method: Arc<dyn RpcMethod>,
        time_budget: Option<Duration>,
    ) -> &mut Self {
        let registration = Registration {
            method,
            time_budget,
        };
        if self.methods.insert(name.clone(), registration).is_some() {
            warn!("RPC method {} replaced by a later registration", name);
        } else {
            debug!("Registered rpc method {}", name);
        }
        self
    }

    /// Remove a method. Returns whether it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.methods.remove(name).is_some()
    }

    /// Budget applied to methods registered without one.
    pub const fn set_default_budget(&mut self, budget: Duration) -> &mut Self {
        self.default_budget = budget;
        self
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no method is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Run the method named by the event type with the payload's arguments.
    ///
    /// Exceeding the time budget only logs a warning; the call is never cut
    /// short.
    ///
    /// # Errors
    ///
    /// [`Error::MethodNotFound`] for an unknown method, and
    /// [`Error::RpcExecution`] if binding failed or the method returned an error
    /// or panicked.
    #[instrument(skip(self, ctx, event), fields(method = %event.event_type(), event_id = %event.id()))]
    pub async fn execute(&self, ctx: Context, event: &Event) -> Result<Value> {
        let method = event.event_type();
        let Some(registration) = self.methods.get(method) else {
            warn!("Call to unknown rpc method {}", method);
            return Err(Error::MethodNotFound {
                method: method.to_string(),
            });
        };
        let handler = registration.method.clone();
        let budget = registration.time_budget.unwrap_or(self.default_budget);
        let args = RpcArgs::from_payload(event.payload());

        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.call(ctx, args.clone()))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        if elapsed > budget {
            warn!(
                "RPC method {} took {:?}, over its {:?} budget",
                method, elapsed, budget
            );
        }

        let (code, message) = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.downcast_ref::<ArgumentError>().is_some() => {
                (FaultCode::InvalidArguments, format!("{e:#}"))
            }
            Ok(Err(e)) => (FaultCode::ExecutionFailed, format!("{e:#}")),
            Err(panic) => (
                FaultCode::ExecutionFailed,
                format!("panicked: {}", panic_message(panic.as_ref())),
            ),
        };

        error!(?args, ?event, "RPC method {} failed: {}", method, message);
        Err(Error::RpcExecution {
            method: method.to_string(),
            code,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;
    use crate::queue::{EventQueue, ReplyQueue};
    use parking_lot::RwLock;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    fn context() -> Context {
        Context::new(
            "rpc-test".to_string(),
            "rpc_0000".to_string(),
            Arc::new(EventQueue::new()),
            Arc::new(ReplyQueue::new()),
            false,
            Arc::new(RwLock::new(EngineState::Active)),
            CancellationToken::new(),
        )
    }

    fn call(method: &str, payload: Value) -> Event {
        Event::builder(method)
            .payload(payload)
            .channel("rpc_0000")
            .reply_to("rpc_1111")
            .build()
            .unwrap()
    }

    fn registry() -> RpcMethodRegistry {
        let mut registry = RpcMethodRegistry::new();
        registry
            .register("add", typed(|(a, b): (i64, i64)| Ok(a + b)))
            .register(
                "boom",
                typed(|(): ()| -> anyhow::Result<i64> { anyhow::bail!("exploded") }),
            );
        registry
    }

    #[test]
    fn test_payload_shapes() {
        assert_eq!(
            RpcArgs::from_payload(&json!([[1], {"k": 2}])),
            RpcArgs {
                args: vec![json!(1)],
                kwargs: json!({"k": 2}).as_object().cloned().unwrap(),
            }
        );
        assert_eq!(
            RpcArgs::from_payload(&json!([2, 3])).args,
            vec![json!(2), json!(3)]
        );
        assert_eq!(
            RpcArgs::from_payload(&json!({"x": 1})).kwargs.get("x"),
            Some(&json!(1))
        );
        assert!(RpcArgs::from_payload(&Value::Null).is_empty());
        assert_eq!(RpcArgs::from_payload(&json!("solo")).args, vec![json!("solo")]);
    }

    #[test]
    fn test_bind_by_name_and_position() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Order {
            symbol: String,
            qty: u32,
        }

        let by_name = RpcArgs::from_payload(&json!({"symbol": "ABC", "qty": 5}));
        let by_position = RpcArgs::from_payload(&json!(["ABC", 5]));
        let expected = Order {
            symbol: "ABC".to_string(),
            qty: 5,
        };

        assert_eq!(by_name.bind::<Order>().unwrap(), expected);
        assert_eq!(by_position.bind::<Order>().unwrap(), expected);
        assert_eq!(RpcArgs::from_payload(&json!(7)).bind::<i64>().unwrap(), 7);
        assert!(RpcArgs::default().bind::<()>().is_ok());
    }

    #[test]
    fn test_bind_rejects_mixed_arguments() {
        let args = RpcArgs::from_payload(&json!([[1], {"b": 2}]));
        assert!(args.bind::<(i64, i64)>().is_err());
    }

    #[tokio::test]
    async fn test_execute_success() {
        let result = registry()
            .execute(context(), &call("add", json!([2, 3])))
            .await
            .unwrap();

        assert_eq!(result, json!(5));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_execute_failure_becomes_value() {
        let registry = registry();

        let err = registry
            .execute(context(), &call("boom", Value::Null))
            .await
            .unwrap_err();
        let fault = RpcFault::from(&err);

        assert_eq!(fault.code, FaultCode::ExecutionFailed);
        assert!(fault.message.contains("exploded"));
        assert!(logs_contain("RPC method boom failed"));

        let still_works = registry
            .execute(context(), &call("add", json!([20, 22])))
            .await
            .unwrap();
        assert_eq!(still_works, json!(42));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let err = registry()
            .execute(context(), &call("nope", Value::Null))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MethodNotFound { ref method } if method == "nope"));
        assert_eq!(RpcFault::from(&err).code, FaultCode::MethodNotFound);
    }

    #[tokio::test]
    async fn test_bad_arguments_reported() {
        let err = registry()
            .execute(context(), &call("add", json!(["two", 3])))
            .await
            .unwrap_err();

        assert_eq!(RpcFault::from(&err).code, FaultCode::InvalidArguments);
    }

    #[tokio::test]
    async fn test_panic_contained() {
        let mut registry = RpcMethodRegistry::new();
        registry.register(
            "divide",
            typed(|(a, b): (i64, i64)| {
                assert!(b != 0, "division by zero");
                Ok(a / b)
            }),
        );

        let err = registry
            .execute(context(), &call("divide", json!([1, 0])))
            .await
            .unwrap_err();

        assert!(RpcFault::from(&err).message.contains("division by zero"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_over_budget_only_warns() {
        let mut registry = RpcMethodRegistry::new();
        registry.register_with_budget(
            "slow",
            raw(|_ctx, _args| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("done"))
            }),
            Duration::from_millis(5),
        );

        let result = registry
            .execute(context(), &call("slow", Value::Null))
            .await
            .unwrap();

        assert_eq!(result, json!("done"));
        assert!(logs_contain("over its"));
    }

    #[tokio::test]
    async fn test_context_aware_method_sees_context() {
        let mut registry = RpcMethodRegistry::new();
        registry.register(
            "whoami",
            typed_with_context(|ctx: &Context, (): ()| Ok(ctx.name().to_string())),
        );

        let result = registry
            .execute(context(), &call("whoami", Value::Null))
            .await
            .unwrap();

        assert_eq!(result, json!("rpc-test"));
    }

    #[test]
    fn test_fault_payload_round_trip() {
        let fault = RpcFault {
            code: FaultCode::MethodNotFound,
            message: "rpc method nope not found".to_string(),
        };

        let payload = fault.to_payload();

        assert_eq!(payload["__error__"]["code"], json!("method_not_found"));
        assert_eq!(RpcFault::from_payload(&payload), Some(fault));
        assert_eq!(RpcFault::from_payload(&json!(5)), None);
    }

    #[test]
    fn test_methods_sorted() {
        assert_eq!(registry().methods(), ["add", "boom"]);
    }
}
