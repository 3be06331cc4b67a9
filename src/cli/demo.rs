//! Pipelines behind the `run` and `broker` commands

use crate::broker::{BrokerClient, Envelope, Message, TrackKind};
use crate::core::{Fragment, Scope, StepError};
use crate::execution::{ChainRuntime, Entry, Input};
use crate::persistence::{id_field, Document, DocumentStore};
use crate::registry::{Bound, HandlerRegistry, Method, Middleware};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Insert the greeter and greetee the demo refers to
pub async fn seed(store: &dyn DocumentStore) -> anyhow::Result<()> {
    store
        .insert("human", document(json!({"humanId": "h1", "humanName": "Ann"})))
        .await?;
    store
        .insert("robot", document(json!({"robotId": "r1", "robotName": "R2"})))
        .await?;
    Ok(())
}

async fn verify_id(
    store: Arc<dyn DocumentStore>,
    collection: &'static str,
    id: Option<String>,
) -> Result<Fragment, StepError> {
    let field = id_field(collection);
    let id = id.ok_or_else(|| StepError::reject(format!("{} is required", field)))?;
    let mut criteria = Document::new();
    criteria.insert(field.clone(), Value::String(id.clone()));
    if store.count(collection, &criteria).await? == 0 {
        return Err(StepError::reject(format!("no {} with {} {}", collection, field, id)));
    }
    Ok(Fragment::new())
}

fn required(scope: &Scope, key: &str) -> Result<String, StepError> {
    scope
        .get_str(key)
        .filter(|value| !value.is_empty())
        .map(String::from)
        .ok_or_else(|| StepError::reject(format!("{} is required", key)))
}

/// Records a greeting between a human and a robot
///
/// Expects `greeterId`, `greeteeId` and `salutation`; resolves with the
/// stored `greetingId`.
pub fn greeting_pipeline(runtime: &Arc<ChainRuntime>, store: Arc<dyn DocumentStore>) -> Entry {
    let greeters = store.clone();
    let greetees = store.clone();

    runtime
        .start("parse options", |scope, next, _| {
            let salutation = scope.get_str("salutation").unwrap_or("Hello").to_string();
            required(&scope, "greeterId")?;
            required(&scope, "greeteeId")?;
            next.call(Fragment::new().with("salutation", salutation));
            Ok(())
        })
        .step_async("verify greeter ${greeterId}", move |scope| {
            verify_id(greeters.clone(), "human", scope.get_str("greeterId").map(String::from))
        })
        .step_async("verify greetee ${greeteeId}", move |scope| {
            verify_id(greetees.clone(), "robot", scope.get_str("greeteeId").map(String::from))
        })
        .step_async("insert Greeting", move |scope| {
            let store = store.clone();
            async move {
                let greeting = document(json!({
                    "greeterId": required(&scope, "greeterId")?,
                    "greeteeId": required(&scope, "greeteeId")?,
                    "greeterType": "human",
                    "greeteeType": "robot",
                    "salutation": scope.get("salutation").cloned().unwrap_or(Value::Null),
                }));
                let stored = store.insert("greeting", greeting).await?;
                Ok(Fragment::from(stored))
            }
        })
        .catch("report greeting failure", |scope, next, _| {
            if let Some(error) = scope.error() {
                tracing::debug!(%error, "Greeting rejected");
                next.call(error.clone());
            }
            Ok(())
        })
        .build()
}

/// Io middleware logging each greeting request and its stored id
fn audit(runtime: Arc<ChainRuntime>) -> Arc<dyn Middleware> {
    Arc::new(move |options: &Fragment, inner: Option<Bound>| {
        let inner = inner?;
        let entry = runtime
            .start("audit greeting of ${greeteeId}", move |scope, next, _| {
                tracing::info!(
                    greeter = scope.get_str("greeterId").unwrap_or_default(),
                    greetee = scope.get_str("greeteeId").unwrap_or_default(),
                    "Greeting requested"
                );
                next.delegate(inner.entry(), Fragment::merged([inner.options(), &scope.fragment()]));
                Ok(())
            })
            .step("record audit", |scope, next, _| {
                tracing::info!(greeting_id = scope.get_str("greetingId").unwrap_or_default(), "Greeting stored");
                next.call(Input::new());
                Ok(())
            })
            .build();
        Some(Bound::new(entry, options.clone()))
    })
}

/// Handlers and middleware the demo methods are bound from
pub fn registry(runtime: &Arc<ChainRuntime>, store: Arc<dyn DocumentStore>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_handler("greet", greeting_pipeline(runtime, store))
        .register_middleware("audit", audit(runtime.clone()));
    registry
}

/// The greet handler behind the audit middleware, saying "Hello" unless told otherwise
pub fn greeting_method() -> Method {
    Method::new()
        .stack_io_middleware("audit", Fragment::new())
        .set_logical_handler("greet", Fragment::new().with("salutation", "Hello"))
}

/// Publishes one event on the client's event track
pub fn publish_pipeline(runtime: &Arc<ChainRuntime>, client: BrokerClient) -> Entry {
    let ready = client.clone();

    runtime
        .start("wait for broker", move |_, next, _| {
            ready.continue_when_ready(next);
            Ok(())
        })
        .step_async("publish ${eventName} #${publisher}", move |scope| {
            let client = client.clone();
            async move {
                let event_name = scope
                    .get_str("eventName")
                    .ok_or_else(|| StepError::reject("eventName is required"))?
                    .to_string();
                let envelope = Envelope {
                    event_id: Uuid::new_v4().to_string(),
                    event_name: Some(event_name.clone()),
                    notif_name: None,
                    reply_to: Some(client.reply_queue()),
                    data: scope.get("data").cloned().unwrap_or(Value::Null),
                };
                let message = Message::json(&envelope)?.reply_to(client.reply_queue());
                client.publish(TrackKind::Event, &event_name, message).await?;
                Ok(Fragment::new().with("eventId", envelope.event_id))
            }
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionMode;
    use crate::execution::Input;
    use crate::persistence::InMemoryDocuments;

    fn greet(greeter: &str, greetee: &str) -> Input {
        Input::new().with(
            Fragment::new()
                .with("greeterId", greeter)
                .with("greeteeId", greetee)
                .with("salutation", "Hi"),
        )
    }

    #[tokio::test]
    async fn test_greeting_is_stored() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocuments::new());
        seed(store.as_ref()).await.unwrap();
        let entry = greeting_pipeline(&ChainRuntime::new(ExecutionMode::Production), store.clone());

        let outcome = entry.run(greet("h1", "r1")).await.unwrap();

        assert!(outcome.is_ok(), "{:?}", outcome.error);
        assert!(outcome.merged().get("greetingId").is_some());
        let stored = store.find("greeting", &Document::new()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].get("salutation"), Some(&json!("Hi")));
    }

    #[tokio::test]
    async fn test_unknown_greetee_is_rejected_with_step_description() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocuments::new());
        seed(store.as_ref()).await.unwrap();
        let entry = greeting_pipeline(&ChainRuntime::new(ExecutionMode::Production), store.clone());

        let outcome = entry.run(greet("h1", "r9")).await.unwrap();

        let error = outcome.error.expect("greeting should fail");
        assert!(error.is_rejection());
        assert_eq!(
            error.message(),
            "couldn't verify greetee r9 : no robot with robotId r9"
        );
        assert_eq!(store.count("greeting", &Document::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_greeting_method_runs_through_audit() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocuments::new());
        seed(store.as_ref()).await.unwrap();
        let registry = registry(&ChainRuntime::new(ExecutionMode::Production), store.clone());
        let method = greeting_method().bind(&registry, &Fragment::new()).unwrap();

        let defaulted = method
            .run(Fragment::new().with("greeterId", "h1").with("greeteeId", "r1"))
            .await
            .unwrap();
        let explicit = method.run(greet("h1", "r1")).await.unwrap();
        let rejected = method.run(greet("h1", "r9")).await.unwrap();

        assert!(defaulted.is_ok(), "{:?}", defaulted.error);
        assert!(explicit.is_ok(), "{:?}", explicit.error);
        let mut salutations: Vec<String> = store
            .find("greeting", &Document::new())
            .await
            .unwrap()
            .iter()
            .filter_map(|g| g.get("salutation").and_then(Value::as_str).map(String::from))
            .collect();
        salutations.sort();
        assert_eq!(salutations, vec!["Hello", "Hi"]);
        assert_eq!(
            rejected.error.map(|e| e.message().to_string()).as_deref(),
            Some("couldn't audit greeting of r9 : couldn't verify greetee r9 : no robot with robotId r9")
        );
    }
}
