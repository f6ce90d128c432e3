//! Static function registry baked into this guest image at build time.
//! Stands in for the dynamic module-import lookup the wire contract
//! describes; an image without a general-purpose loader registers its
//! callable surface ahead of time instead, keyed by the same
//! `"module:name"` strings a caller would otherwise import.

use std::sync::Arc;

use shared::executor::FunctionRegistry;
use shared::rpc::RemoteError;
use shared::wire::Value;

pub fn build() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    registry.register(
        "benchmarks.bench_executor:noop",
        Arc::new(|_args, _kwargs| Box::pin(async move { Ok(Value::Null) })),
    );

    registry.register(
        "benchmarks.bench_executor:simple_add",
        Arc::new(|args, _kwargs| {
            Box::pin(async move {
                let a = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| RemoteError::new("TypeError", "simple_add expects two integers"))?;
                let b = args
                    .get(1)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| RemoteError::new("TypeError", "simple_add expects two integers"))?;
                Ok(Value::Int(a + b))
            })
        }),
    );

    registry.register(
        "benchmarks.bench_executor:process_list",
        Arc::new(|args, _kwargs| {
            Box::pin(async move {
                let items = match args.first() {
                    Some(Value::Seq(items)) => items.clone(),
                    _ => return Err(RemoteError::new("TypeError", "process_list expects a single sequence")),
                };
                let doubled = items
                    .into_iter()
                    .map(|item| match item {
                        Value::Int(n) => Ok(Value::Int(n * 2)),
                        other => Err(other),
                    })
                    .collect::<Result<Vec<_>, _>>();
                match doubled {
                    Ok(doubled) => Ok(Value::Seq(doubled)),
                    Err(_) => Err(RemoteError::new("TypeError", "process_list expects a sequence of integers")),
                }
            })
        }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_list_doubles_each_element() {
        let registry = build();
        let handler = registry.resolve("benchmarks.bench_executor:process_list").unwrap();
        let result = handler(vec![Value::Seq(vec![Value::Int(1), Value::Int(2), Value::Int(3)])], vec![])
            .await
            .unwrap();
        assert_eq!(result, Value::Seq(vec![Value::Int(2), Value::Int(4), Value::Int(6)]));
    }

    #[tokio::test]
    async fn simple_add_rejects_non_integer_args() {
        let registry = build();
        let handler = registry.resolve("benchmarks.bench_executor:simple_add").unwrap();
        let err = handler(vec![Value::Str("x".to_string())], vec![]).await.unwrap_err();
        assert_eq!(err.error_type, "TypeError");
    }
}
