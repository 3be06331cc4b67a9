//! Job scheduler
//!
//! Jobs are registered through a two-level ladder: the scheduler handle,
//! then one `job=<name>` level per job. Registering a name that is already
//! scheduled in the same cache reuses the existing registration.

use crate::core::scope::Fragment;
use crate::execution::{Entry, Input};
use crate::resource::{
    ConnectionLadder, Declared, LadderConfig, Level, LifecycleListener, ListenerGuard, Listeners,
    Resource, ResourceCache, ResourceError, Rungs, SharedResource,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// When a job fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Repeatedly, one period after another
    Every(Duration),
    /// Once, at the given time (immediately if it already passed)
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub schedule: Schedule,
}

impl JobSpec {
    pub fn every(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            schedule: Schedule::Every(period),
        }
    }

    pub fn at(name: impl Into<String>, when: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            schedule: Schedule::At(when),
        }
    }

    /// Reject specs that could never be scheduled
    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.name.is_empty() {
            return Err(ResourceError::InvalidConfig("job name is empty".to_string()));
        }
        match self.schedule {
            Schedule::Every(period) if period.is_zero() => Err(ResourceError::InvalidConfig(format!(
                "job {} has a zero period",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

const SCHEDULER_KEY: &str = "scheduler";

/// Ladder resource owning the running job tasks
pub struct SchedulerHandle {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    listeners: Listeners,
    guard: ListenerGuard,
}

impl SchedulerHandle {
    fn register(&self, name: &str, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(previous) = tasks.insert(name.to_string(), task) {
                previous.abort();
            }
        }
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .lock()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.abort_all();
    }
}

impl Resource for SchedulerHandle {
    fn subscribe(&self, listener: LifecycleListener) {
        self.listeners.subscribe(listener)
    }

    fn listener_guard(&self) -> &ListenerGuard {
        &self.guard
    }
}

fn fire(entry: &Entry, name: &str, fired: &AtomicUsize) {
    fired.fetch_add(1, Ordering::SeqCst);
    let fired_at = Utc::now().to_rfc3339();
    tracing::debug!(job = %name, %fired_at, "Job fired");

    let job = name.to_string();
    entry.invoke(
        Input::new()
            .with(Fragment::new().with("jobName", name).with("firedAt", fired_at))
            .on_done(move |outcome| {
                if let Some(error) = outcome.error {
                    tracing::warn!(job = %job, %error, "Job pipeline failed");
                }
            }),
    );
}

/// Schedules pipeline entries to run on an interval or at a given time
pub struct JobScheduler {
    cache: ResourceCache<SharedResource>,
    config: LadderConfig,
    ladders: Mutex<Vec<ConnectionLadder>>,
    fired: Arc<AtomicUsize>,
}

impl JobScheduler {
    pub fn new(cache: ResourceCache<SharedResource>, config: LadderConfig) -> Self {
        Self {
            cache,
            config,
            ladders: Mutex::new(Vec::new()),
            fired: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total firings across every job
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    fn scheduler_level() -> Level {
        Level::from_fn(SCHEDULER_KEY, |_| async {
            tracing::debug!("Starting job scheduler");
            Ok(Arc::new(SchedulerHandle {
                tasks: Mutex::new(HashMap::new()),
                listeners: Listeners::default(),
                guard: ListenerGuard::default(),
            }) as SharedResource)
        })
    }

    fn job_level(&self, spec: JobSpec, entry: Entry) -> Level {
        let fired = self.fired.clone();
        Level::from_fn(format!("job={}", spec.name), move |rungs: Rungs| {
            let spec = spec.clone();
            let entry = entry.clone();
            let fired = fired.clone();
            async move {
                let handle = rungs.require::<SchedulerHandle>(SCHEDULER_KEY)?;
                let name = spec.name.clone();
                let task = match spec.schedule {
                    Schedule::Every(period) => {
                        let name = name.clone();
                        tokio::spawn(async move {
                            let start = tokio::time::Instant::now() + period;
                            let mut ticks = tokio::time::interval_at(start, period);
                            loop {
                                ticks.tick().await;
                                fire(&entry, &name, &fired);
                            }
                        })
                    }
                    Schedule::At(when) => {
                        let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        let name = name.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            fire(&entry, &name, &fired);
                        })
                    }
                };
                handle.register(&name, task);
                tracing::debug!(job = %name, schedule = ?spec.schedule, "Scheduled job");
                Ok(Declared::new(name) as SharedResource)
            }
        })
    }

    /// Register a job and wait until it is scheduled
    ///
    /// Invalid specs are rejected before anything is created.
    pub async fn schedule(&self, spec: JobSpec, entry: Entry) -> Result<(), ResourceError> {
        spec.validate()?;
        let ladder = ConnectionLadder::new(
            format!("cron:{}", spec.name),
            self.cache.clone(),
            vec![Self::scheduler_level().then(self.job_level(spec, entry))],
            self.config.clone(),
        )?;
        if let Ok(mut ladders) = self.ladders.lock() {
            ladders.push(ladder.clone());
        }
        ladder.ready().await?;
        Ok(())
    }

    /// Names of the jobs currently scheduled
    pub async fn job_names(&self) -> Result<Vec<String>, ResourceError> {
        let ladder = ConnectionLadder::new(
            "cron",
            self.cache.clone(),
            vec![Self::scheduler_level()],
            self.config.clone(),
        )?;
        let rungs = ladder.ready().await?;
        Ok(rungs.require::<SchedulerHandle>(SCHEDULER_KEY)?.job_names())
    }
}
