//! Scenarios for document stores and scheduled jobs driving pipelines

mod helpers;

use helpers::doc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stepline::cli::demo;
use stepline::jobs::{JobScheduler, JobSpec};
use stepline::persistence::{Document, DocumentStore, InMemoryDocuments};
use stepline::resource::{LadderConfig, ResourceCache};
use stepline::{ChainRuntime, Entry, ExecutionMode, Fragment, Input, StepError};

/// Pipeline storing one `tick` document per invocation
fn tick_recorder(store: Arc<dyn DocumentStore>) -> Entry {
    ChainRuntime::new(ExecutionMode::Production)
        .start_async("record tick of ${jobName}", move |scope| {
            let store = store.clone();
            async move {
                let job = scope
                    .get_str("jobName")
                    .ok_or_else(|| StepError::reject("jobName is required"))?
                    .to_string();
                store.insert("tick", doc(json!({ "jobName": job }))).await?;
                Ok(Fragment::new())
            }
        })
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_job_runs_pipeline_each_period() {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocuments::new());
    let scheduler = JobScheduler::new(ResourceCache::new(), LadderConfig::default());

    scheduler
        .schedule(
            JobSpec::every("Human.tick:5s", Duration::from_secs(5)),
            tick_recorder(store.clone()),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(16)).await;

    let ticks = store
        .find("tick", &doc(json!({ "jobName": "Human.tick:5s" })))
        .await
        .unwrap();
    assert_eq!(ticks.len(), 3);
    assert_eq!(scheduler.fired(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_jobs_share_one_scheduler() {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocuments::new());
    let scheduler = JobScheduler::new(ResourceCache::new(), LadderConfig::default());

    for name in ["Robot.sweep:1m", "Human.digest:1m"] {
        scheduler
            .schedule(
                JobSpec::every(name, Duration::from_secs(60)),
                tick_recorder(store.clone()),
            )
            .await
            .unwrap();
    }

    assert_eq!(
        scheduler.job_names().await.unwrap(),
        vec!["Human.digest:1m".to_string(), "Robot.sweep:1m".to_string()]
    );
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(store.count("tick", &Document::new()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_greeting_demo_over_memory_store() {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocuments::new());
    demo::seed(store.as_ref()).await.unwrap();
    let entry = demo::greeting_pipeline(&ChainRuntime::new(ExecutionMode::Production), store.clone());

    let outcome = entry
        .run(
            Input::new().with(
                Fragment::new()
                    .with("greeterId", "h1")
                    .with("greeteeId", "r1"),
            ),
        )
        .await
        .unwrap();

    assert!(outcome.is_ok());
    let greetings = store
        .find("greeting", &doc(json!({ "greeterId": "h1", "greeteeId": "r1" })))
        .await
        .unwrap();
    assert_eq!(greetings.len(), 1);
    assert_eq!(greetings[0].get("salutation"), Some(&json!("Hello")));
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use stepline::persistence::SqliteDocumentStore;

    #[tokio::test]
    async fn test_upsert_merges_stored_document() {
        let store = SqliteDocumentStore::new("sqlite::memory:", LadderConfig::default());

        store
            .insert("robot", doc(json!({ "robotId": "r1", "robotName": "R2", "model": "astromech" })))
            .await
            .unwrap();
        let merged = store
            .insert("robot", doc(json!({ "robotId": "r1", "robotName": "R2-D2" })))
            .await
            .unwrap();

        assert_eq!(merged.get("model"), Some(&json!("astromech")));
        assert_eq!(merged.get("robotName"), Some(&json!("R2-D2")));
        assert_eq!(store.count("robot", &Document::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_greeting_demo_over_sqlite() {
        let store = Arc::new(SqliteDocumentStore::new("sqlite::memory:", LadderConfig::default()));
        demo::seed(store.as_ref()).await.unwrap();
        let entry = demo::greeting_pipeline(&ChainRuntime::new(ExecutionMode::Production), store.clone());

        let ok = entry
            .run(Fragment::new().with("greeterId", "h1").with("greeteeId", "r1"))
            .await
            .unwrap();
        let rejected = entry
            .run(Fragment::new().with("greeterId", "h2").with("greeteeId", "r1"))
            .await
            .unwrap();

        assert!(ok.is_ok());
        assert_eq!(
            rejected.error.map(|e| e.message().to_string()).as_deref(),
            Some("couldn't verify greeter h2 : no human with humanId h2")
        );
        assert_eq!(store.count("greeting", &Document::new()).await.unwrap(), 1);
        // human, robot and greeting tables on one pool
        assert_eq!(store.pools_opened(), 1);
    }

    #[tokio::test]
    async fn test_remove_by_criteria() {
        let store = SqliteDocumentStore::new("sqlite::memory:", LadderConfig::default());
        for (greeter, greetee) in [("h1", "r1"), ("h1", "r2"), ("h2", "r1")] {
            store
                .insert("greeting", doc(json!({ "greeterId": greeter, "greeteeId": greetee })))
                .await
                .unwrap();
        }

        let removed = store
            .remove("greeting", &doc(json!({ "greeterId": "h1" })))
            .await
            .unwrap();

        assert_eq!(removed, 2);
        let left = store.find("greeting", &Document::new()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].get("greeterId"), Some(&json!("h2")));
    }
}
