//! Dispatch core shared by the real guest executor and the in-process
//! stand-in used for host-side tests. Both speak the identical wire
//! contract; only the transport underneath (vsock vs. loopback TCP) and the
//! registered functions differ.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::rpc::{RemoteError, RpcRequest, RpcResponse};
use crate::wire::{self, Value};

pub type HandlerFn =
    Arc<dyn Fn(Vec<Value>, Vec<(String, Value)>) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;

pub type InstallFn = Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<(), RemoteError>> + Send + Sync>;

/// Static, build-time registry of `"module:dotted.name"` function references.
/// Stands in for the runtime module-import lookup the wire contract
/// describes, which a guest image without a dynamic loader cannot perform.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: std::collections::HashMap<String, HandlerFn>,
    modules: HashSet<String>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, function_ref: &str, handler: HandlerFn) {
        if let Some((module, _)) = function_ref.split_once(':') {
            self.modules.insert(module.to_string());
        }
        self.functions.insert(function_ref.to_string(), handler);
    }

    /// Resolves a function reference. The leftmost colon splits module from
    /// attribute path; everything after it is an opaque registry key, since
    /// there is no dotted-attribute walk to perform against a static table.
    pub fn resolve(&self, function_ref: &str) -> Result<HandlerFn, RemoteError> {
        if let Some(handler) = self.functions.get(function_ref) {
            return Ok(handler.clone());
        }

        match function_ref.split_once(':') {
            None => Err(RemoteError::new(
                "ValueError",
                format!("Invalid function reference: {function_ref}"),
            )),
            Some((module, _)) if !self.modules.contains(module) => Err(RemoteError::new(
                "ModuleNotFoundError",
                format!("No module named '{module}'"),
            )),
            Some(_) => Err(RemoteError::new(
                "AttributeError",
                format!("{function_ref} is not callable"),
            )),
        }
    }
}

/// Runs the accept-loop body for one already-connected stream: process
/// framed messages sequentially until the peer closes or sends something
/// that fails to decode, per the single-threaded synchronous contract in
/// the guest executor's component design.
pub async fn serve_connection<S>(mut stream: S, registry: Arc<FunctionRegistry>, install: InstallFn)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match wire::recv_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return,
        };

        let request: RpcRequest = match postcard::from_bytes(&frame) {
            Ok(request) => request,
            // An empty/malformed envelope is a transport-level framing
            // error, not a response: close rather than answer it.
            Err(_) => return,
        };

        let response = match request {
            RpcRequest::Call {
                request_id,
                function_ref,
                args,
                kwargs,
                timeout_ms,
            } => handle_call(&registry, request_id, function_ref, args, kwargs, timeout_ms).await,
            RpcRequest::Install {
                request_id,
                dependencies,
            } => handle_install(&install, request_id, dependencies).await,
        };

        let payload = match postcard::to_allocvec(&response) {
            Ok(payload) => payload,
            Err(_) => return,
        };

        if wire::send_frame(&mut stream, &payload).await.is_err() {
            return;
        }
    }
}

async fn handle_call(
    registry: &FunctionRegistry,
    request_id: String,
    function_ref: String,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    timeout_ms: u32,
) -> RpcResponse {
    let handler = match registry.resolve(&function_ref) {
        Ok(handler) => handler,
        Err(e) => return RpcResponse::failed(request_id, e),
    };

    let call = handler(args, kwargs);
    let outcome = if timeout_ms == 0 {
        call.await
    } else {
        match tokio::time::timeout(Duration::from_millis(timeout_ms as u64), call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RemoteError::new(
                "TimeoutError",
                format!("Function execution exceeded {timeout_ms}ms"),
            )),
        }
    };

    match outcome {
        Ok(value) => RpcResponse::ok(request_id, value),
        Err(e) => RpcResponse::failed(request_id, e),
    }
}

async fn handle_install(install: &InstallFn, request_id: String, dependencies: Vec<String>) -> RpcResponse {
    match install(dependencies).await {
        Ok(()) => RpcResponse::ok(request_id, Value::Null),
        Err(e) => RpcResponse::failed(request_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_add() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register(
            "benchmarks.bench_executor:simple_add",
            Arc::new(|args, _kwargs| {
                Box::pin(async move {
                    let a = args[0].as_i64().unwrap();
                    let b = args[1].as_i64().unwrap();
                    Ok(Value::Int(a + b))
                })
            }),
        );
        registry
    }

    #[tokio::test]
    async fn dispatches_a_registered_call() {
        let registry = registry_with_add();
        let resp = handle_call(
            &registry,
            "req-1".to_string(),
            "benchmarks.bench_executor:simple_add".to_string(),
            vec![Value::Int(1), Value::Int(2)],
            vec![],
            1000,
        )
        .await;

        assert!(resp.success);
        assert_eq!(resp.result, Some(Value::Int(3)));
        assert_eq!(resp.request_id, "req-1");
    }

    #[tokio::test]
    async fn unresolved_function_ref_in_known_module_is_attribute_error() {
        let registry = registry_with_add();
        let resp = handle_call(
            &registry,
            "req-2".to_string(),
            "benchmarks.bench_executor:missing".to_string(),
            vec![],
            vec![],
            1000,
        )
        .await;

        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().error_type, "AttributeError");
    }

    #[tokio::test]
    async fn unknown_module_is_module_not_found_error() {
        let registry = registry_with_add();
        let resp = handle_call(
            &registry,
            "req-3".to_string(),
            "nope:fn".to_string(),
            vec![],
            vec![],
            1000,
        )
        .await;

        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().error_type, "ModuleNotFoundError");
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let mut registry = FunctionRegistry::new();
        registry.register(
            "test:sleep200",
            Arc::new(|_args, _kwargs| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(Value::Null)
                })
            }),
        );

        let resp = handle_call(
            &registry,
            "req-4".to_string(),
            "test:sleep200".to_string(),
            vec![],
            vec![],
            50,
        )
        .await;

        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().error_type, "TimeoutError");
    }

    #[tokio::test]
    async fn serve_connection_echoes_request_id_over_a_duplex_pipe() {
        let (mut client, server) = tokio::io::duplex(4096);
        let registry = Arc::new(registry_with_add());
        let install: InstallFn = Arc::new(|_deps| Box::pin(async { Ok(()) }));

        let serving = tokio::spawn(serve_connection(server, registry, install));

        let request = RpcRequest::Call {
            request_id: "wire-1".to_string(),
            function_ref: "benchmarks.bench_executor:simple_add".to_string(),
            args: vec![Value::Int(4), Value::Int(5)],
            kwargs: vec![],
            timeout_ms: 1000,
        };
        let payload = postcard::to_allocvec(&request).unwrap();
        wire::send_frame(&mut client, &payload).await.unwrap();

        let frame = wire::recv_frame(&mut client).await.unwrap();
        let response: RpcResponse = postcard::from_bytes(&frame).unwrap();

        assert_eq!(response.request_id, "wire-1");
        assert_eq!(response.result, Some(Value::Int(9)));

        drop(client);
        let _ = serving.await;
    }
}
