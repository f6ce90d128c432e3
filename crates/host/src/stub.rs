//! Callable handle bound to one function reference and capability profile.
//! Built once per sandboxed function and invoked many times; each call
//! builds a fresh [`RpcRequest`], round-trips it through the owning
//! [`crate::supervisor::Supervisor`]'s pool, and unpacks the response.

use std::sync::Arc;

use shared::profile::CapabilityProfile;
use shared::rpc::RpcRequest;
use shared::wire::Value;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::supervisor::Supervisor;

pub struct Stub {
    pub function_ref: String,
    pub profile: CapabilityProfile,
    pub profile_key: String,
    supervisor: Arc<Supervisor>,
}

impl Stub {
    pub fn new(function_ref: impl Into<String>, profile: CapabilityProfile, supervisor: Arc<Supervisor>) -> Self {
        let profile_key = profile.fingerprint();
        Stub {
            function_ref: function_ref.into(),
            profile,
            profile_key,
            supervisor,
        }
    }

    fn build_request(&self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> RpcRequest {
        RpcRequest::Call {
            request_id: Uuid::new_v4().to_string(),
            function_ref: self.function_ref.clone(),
            args,
            kwargs,
            timeout_ms: self.profile.cpu_ms,
        }
    }

    /// Dispatches the call and unwraps a successful result, or turns a
    /// failure response into the matching [`SandboxError`] variant.
    pub async fn call_async(&self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<Value, SandboxError> {
        let request = self.build_request(args, kwargs);
        let response = self
            .supervisor
            .execute(&self.profile, &self.profile_key, request)
            .await?;

        if response.success {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            let error = response
                .error
                .unwrap_or_else(|| shared::rpc::RemoteError::new("Unknown", "Unknown error occurred in sandbox"));

            if error.error_type == "TimeoutError" {
                Err(SandboxError::SandboxTimeout {
                    function_ref: self.function_ref.clone(),
                    cpu_ms: self.profile.cpu_ms,
                })
            } else {
                Err(error.into())
            }
        }
    }

    /// Synchronous entry point for non-async callers: drives [`call_async`]
    /// to completion on whatever tokio runtime is available, spinning up a
    /// throwaway current-thread one if called outside of any runtime.
    pub fn call(&self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<Value, SandboxError> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(self.call_async(args, kwargs))),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("building a current-thread runtime");
                runtime.block_on(self.call_async(args, kwargs))
            }
        }
    }
}
