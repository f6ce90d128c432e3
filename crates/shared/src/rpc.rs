use crate::wire::Value;

/// One message sent from host to guest. `Call` dispatches a function
/// reference; `Install` is the in-band dependency-provisioning command used
/// while baking a snapshot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RpcRequest {
    Call {
        request_id: String,
        function_ref: String,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        timeout_ms: u32,
    },
    Install {
        request_id: String,
        dependencies: Vec<String>,
    },
}

impl RpcRequest {
    pub fn request_id(&self) -> &str {
        match self {
            RpcRequest::Call { request_id, .. } => request_id,
            RpcRequest::Install { request_id, .. } => request_id,
        }
    }
}

/// One message sent from guest to host, always echoing the request's
/// `request_id`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RpcResponse {
    pub request_id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<RemoteError>,
}

impl RpcResponse {
    pub fn ok(request_id: impl Into<String>, result: Value) -> Self {
        RpcResponse {
            request_id: request_id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: RemoteError) -> Self {
        RpcResponse {
            request_id: request_id.into(),
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

/// The `(type, message, traceback)` triple exceptions travel as across the
/// host/guest boundary; the host reconstructs a tagged error from it rather
/// than re-raising a typed exception tree.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemoteError {
    pub error_type: String,
    pub message: String,
    pub traceback: String,
}

impl RemoteError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            error_type: error_type.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_echoes_request_id() {
        let req = RpcRequest::Call {
            request_id: "abc".to_string(),
            function_ref: "mod:fn".to_string(),
            args: vec![],
            kwargs: vec![],
            timeout_ms: 1000,
        };
        let resp = RpcResponse::ok(req.request_id(), Value::Null);
        assert_eq!(resp.request_id, req.request_id());
    }

    #[test]
    fn failed_response_carries_no_result() {
        let resp = RpcResponse::failed("abc", RemoteError::new("TimeoutError", "too slow"));
        assert!(!resp.success);
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().error_type, "TimeoutError");
    }
}
