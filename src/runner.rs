use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{
    LocalObjectReference, ObjectReference, Pod, Secret, ServiceAccount,
};
use kube::{
    api::{DeleteParams, ListParams, LogParams, PostParams},
    core::ObjectMeta,
    Api, Client, ResourceExt,
};
use tracing::warn;

use crate::{
    docker_config,
    resources::{Pipeline, PipelineRun, Task, TaskRun},
    Error, Result,
};

/// How often a run's `Succeeded` condition is polled.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The cluster-side surface the resolution pass needs: run CRUD plus log
/// capture, definition lookup for `task://`/`pipeline://`, and the temporary
/// identity pair used by `--as=me`.
///
/// Tests substitute a fake; production wraps `kube::Api`.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn create_task_run(&self, run: &TaskRun) -> Result<TaskRun>;
    async fn get_task_run(&self, namespace: &str, name: &str) -> Result<TaskRun>;
    async fn delete_task_run(&self, namespace: &str, name: &str) -> Result<()>;
    async fn task_run_logs(&self, namespace: &str, name: &str) -> Result<String>;

    async fn create_pipeline_run(&self, run: &PipelineRun) -> Result<PipelineRun>;
    async fn get_pipeline_run(&self, namespace: &str, name: &str) -> Result<PipelineRun>;
    async fn delete_pipeline_run(&self, namespace: &str, name: &str) -> Result<()>;
    async fn pipeline_run_logs(&self, namespace: &str, name: &str) -> Result<String>;

    async fn get_task(&self, namespace: &str, name: &str) -> Result<Task>;
    async fn get_pipeline(&self, namespace: &str, name: &str) -> Result<Pipeline>;

    /// Provisions a service account plus registry-credential secret and
    /// returns the shared name of the pair.
    async fn create_temporary_identity(&self, namespace: &str, registry: &str) -> Result<String>;
    async fn delete_temporary_identity(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Deletions owed for resources created during a run.
///
/// On the normal path the owner awaits [`Cleanup::run`]. If the owning future
/// is dropped mid-flight instead, the pending deletions are spawned onto the
/// runtime as detached tasks so a cancelled resolution does not leak cluster
/// resources. Failures are logged, never escalated.
#[derive(Default)]
pub struct Cleanup {
    pending: Vec<BoxFuture<'static, ()>>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&mut self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        self.pending.push(fut.boxed());
    }

    /// Runs all pending deletions, most recently deferred first.
    pub async fn run(mut self) {
        while let Some(fut) = self.pending.pop() {
            fut.await;
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                futures::future::join_all(pending).await;
            });
        }
    }
}

/// A hook that may mutate a run before submission and owes its own cleanup.
#[async_trait]
pub trait RunOption: Send + Sync {
    async fn prepare_task_run(&self, _run: &mut TaskRun, _cleanup: &mut Cleanup) -> Result<()> {
        Ok(())
    }

    async fn prepare_pipeline_run(
        &self,
        _run: &mut PipelineRun,
        _cleanup: &mut Cleanup,
    ) -> Result<()> {
        Ok(())
    }
}

/// Runs the build as a named, pre-existing service account.
pub struct RunAs(pub String);

#[async_trait]
impl RunOption for RunAs {
    async fn prepare_task_run(&self, run: &mut TaskRun, _cleanup: &mut Cleanup) -> Result<()> {
        run.spec.service_account_name = Some(self.0.clone());
        Ok(())
    }

    async fn prepare_pipeline_run(
        &self,
        run: &mut PipelineRun,
        _cleanup: &mut Cleanup,
    ) -> Result<()> {
        run.spec.service_account_name = Some(self.0.clone());
        Ok(())
    }
}

/// Provisions a temporary service account carrying the caller's registry
/// credentials (the `--as=me` flow) and tears it down with the run.
pub struct TemporaryIdentity {
    pub executor: Arc<dyn JobExecutor>,
    pub registry: String,
}

impl TemporaryIdentity {
    async fn provision(
        &self,
        namespace: &str,
        cleanup: &mut Cleanup,
    ) -> Result<String> {
        let name = self
            .executor
            .create_temporary_identity(namespace, &self.registry)
            .await?;
        let executor = self.executor.clone();
        let namespace = namespace.to_string();
        let deferred = name.clone();
        cleanup.defer(async move {
            if let Err(error) = executor
                .delete_temporary_identity(&namespace, &deferred)
                .await
            {
                warn!(name = %deferred, %error, "failed to delete temporary identity");
            }
        });
        Ok(name)
    }
}

#[async_trait]
impl RunOption for TemporaryIdentity {
    async fn prepare_task_run(&self, run: &mut TaskRun, cleanup: &mut Cleanup) -> Result<()> {
        let namespace = run.namespace().unwrap_or_default();
        run.spec.service_account_name = Some(self.provision(&namespace, cleanup).await?);
        Ok(())
    }

    async fn prepare_pipeline_run(
        &self,
        run: &mut PipelineRun,
        cleanup: &mut Cleanup,
    ) -> Result<()> {
        let namespace = run.namespace().unwrap_or_default();
        run.spec.service_account_name = Some(self.provision(&namespace, cleanup).await?);
        Ok(())
    }
}

/// Submits a TaskRun and waits for its terminal condition.
///
/// The created run (and anything the options provisioned) is deleted on
/// every exit path, including cancellation by drop. On `Succeeded=False`
/// the buffered logs are printed to stderr before the error is returned.
pub async fn run_task(
    executor: &Arc<dyn JobExecutor>,
    run: TaskRun,
    options: &[Arc<dyn RunOption>],
) -> Result<TaskRun> {
    let mut cleanup = Cleanup::new();
    let outcome = run_task_inner(executor, run, options, &mut cleanup).await;
    cleanup.run().await;
    outcome
}

async fn run_task_inner(
    executor: &Arc<dyn JobExecutor>,
    mut run: TaskRun,
    options: &[Arc<dyn RunOption>],
    cleanup: &mut Cleanup,
) -> Result<TaskRun> {
    for option in options {
        option.prepare_task_run(&mut run, cleanup).await?;
    }

    let created = executor.create_task_run(&run).await?;
    let namespace = created.namespace().unwrap_or_default();
    let name = created.name_any();
    defer_deletion(cleanup, executor, &namespace, &name, Kind::TaskRun);

    loop {
        let latest = executor.get_task_run(&namespace, &name).await?;
        if let Some(condition) = latest.succeeded() {
            if condition.status == "True" {
                return Ok(latest);
            }
            print_logs(executor.task_run_logs(&namespace, &name).await, &name);
            return Err(failure(condition));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// [`run_task`] for PipelineRuns; identical contract.
pub async fn run_pipeline(
    executor: &Arc<dyn JobExecutor>,
    run: PipelineRun,
    options: &[Arc<dyn RunOption>],
) -> Result<PipelineRun> {
    let mut cleanup = Cleanup::new();
    let outcome = run_pipeline_inner(executor, run, options, &mut cleanup).await;
    cleanup.run().await;
    outcome
}

async fn run_pipeline_inner(
    executor: &Arc<dyn JobExecutor>,
    mut run: PipelineRun,
    options: &[Arc<dyn RunOption>],
    cleanup: &mut Cleanup,
) -> Result<PipelineRun> {
    for option in options {
        option.prepare_pipeline_run(&mut run, cleanup).await?;
    }

    let created = executor.create_pipeline_run(&run).await?;
    let namespace = created.namespace().unwrap_or_default();
    let name = created.name_any();
    defer_deletion(cleanup, executor, &namespace, &name, Kind::PipelineRun);

    loop {
        let latest = executor.get_pipeline_run(&namespace, &name).await?;
        if let Some(condition) = latest.succeeded() {
            if condition.status == "True" {
                return Ok(latest);
            }
            print_logs(executor.pipeline_run_logs(&namespace, &name).await, &name);
            return Err(failure(condition));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[derive(Clone, Copy)]
enum Kind {
    TaskRun,
    PipelineRun,
}

fn defer_deletion(
    cleanup: &mut Cleanup,
    executor: &Arc<dyn JobExecutor>,
    namespace: &str,
    name: &str,
    kind: Kind,
) {
    let executor = executor.clone();
    let namespace = namespace.to_string();
    let name = name.to_string();
    cleanup.defer(async move {
        let deleted = match kind {
            Kind::TaskRun => executor.delete_task_run(&namespace, &name).await,
            Kind::PipelineRun => executor.delete_pipeline_run(&namespace, &name).await,
        };
        if let Err(error) = deleted {
            warn!(%name, %error, "failed to delete run");
        }
    });
}

fn failure(condition: &crate::resources::Condition) -> Error {
    Error::BuildFailed {
        reason: condition
            .reason
            .clone()
            .unwrap_or_else(|| "Failed".to_string()),
        message: condition.message.clone().unwrap_or_default(),
    }
}

fn print_logs(logs: Result<String>, name: &str) {
    write_logs(&mut std::io::stderr().lock(), logs, name);
}

/// Emits a failed run's buffered logs. An empty buffer writes nothing; a
/// failed fetch is logged, never escalated over the build error itself.
fn write_logs<W: std::io::Write>(w: &mut W, logs: Result<String>, name: &str) {
    match logs {
        Ok(logs) if !logs.is_empty() => {
            if let Err(error) = writeln!(w, "{logs}") {
                warn!(%name, %error, "failed to write run logs");
            }
        }
        Ok(_) => {}
        Err(error) => warn!(%name, %error, "failed to fetch run logs"),
    }
}

/// The production executor: Tekton CRDs through a kube client.
#[derive(Clone)]
pub struct TektonExecutor {
    client: Client,
}

impl TektonExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Concatenates the logs of every started container belonging to the
    /// pods a run created, keyed by the given pod label selector.
    async fn pod_logs(&self, namespace: &str, selector: String) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams {
                label_selector: Some(selector),
                ..Default::default()
            })
            .await?;

        let mut buffer = String::new();
        for pod in list.items {
            let Some(status) = pod.status.as_ref() else {
                continue;
            };
            let container_statuses = [
                status.init_container_statuses.as_ref(),
                status.container_statuses.as_ref(),
            ]
            .into_iter()
            .flatten()
            .flat_map(|vec| vec.iter());

            for container in container_statuses {
                // Logs are only available once a container has started.
                let waiting = container
                    .state
                    .as_ref()
                    .map(|s| s.waiting.is_some())
                    .unwrap_or(true);
                if waiting {
                    continue;
                }
                let logs = pods
                    .logs(
                        &pod.name_any(),
                        &LogParams {
                            container: Some(container.name.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                buffer.push_str(&format!("=== {}/{} ===\n", pod.name_any(), container.name));
                buffer.push_str(&logs);
                if !logs.ends_with('\n') {
                    buffer.push('\n');
                }
            }
        }
        Ok(buffer)
    }
}

#[async_trait]
impl JobExecutor for TektonExecutor {
    async fn create_task_run(&self, run: &TaskRun) -> Result<TaskRun> {
        let namespace = run.namespace().unwrap_or_default();
        let api: Api<TaskRun> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), run).await?)
    }

    async fn get_task_run(&self, namespace: &str, name: &str) -> Result<TaskRun> {
        let api: Api<TaskRun> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn delete_task_run(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<TaskRun> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn task_run_logs(&self, namespace: &str, name: &str) -> Result<String> {
        self.pod_logs(namespace, format!("tekton.dev/taskRun={name}"))
            .await
    }

    async fn create_pipeline_run(&self, run: &PipelineRun) -> Result<PipelineRun> {
        let namespace = run.namespace().unwrap_or_default();
        let api: Api<PipelineRun> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), run).await?)
    }

    async fn get_pipeline_run(&self, namespace: &str, name: &str) -> Result<PipelineRun> {
        let api: Api<PipelineRun> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn delete_pipeline_run(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PipelineRun> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn pipeline_run_logs(&self, namespace: &str, name: &str) -> Result<String> {
        self.pod_logs(namespace, format!("tekton.dev/pipelineRun={name}"))
            .await
    }

    async fn get_task(&self, namespace: &str, name: &str) -> Result<Task> {
        let api: Api<Task> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_pipeline(&self, namespace: &str, name: &str) -> Result<Pipeline> {
        let api: Api<Pipeline> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn create_temporary_identity(&self, namespace: &str, registry: &str) -> Result<String> {
        let credential = docker_credential::get_credential(registry)?;
        let docker_credential::DockerCredential::UsernamePassword(username, password) = credential
        else {
            return Err(Error::UnsupportedCredentialType(registry.to_string()));
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                generate_name: Some("mink-identity-".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            string_data: Some(
                [(
                    ".dockerconfigjson".to_string(),
                    docker_config::dockerconfigjson_for(registry, &username, &password),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        };
        let secret = secrets.create(&PostParams::default(), &secret).await?;
        let name = secret.name_any();

        // The service account shares the secret's generated name so one
        // handle tears down the pair.
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            image_pull_secrets: Some(vec![LocalObjectReference {
                name: Some(name.clone()),
            }]),
            secrets: Some(vec![ObjectReference {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        if let Err(error) = accounts.create(&PostParams::default(), &account).await {
            // Don't strand the secret when the account fails to appear.
            if let Err(error) = secrets.delete(&name, &DeleteParams::default()).await {
                warn!(%name, %error, "failed to delete credential secret");
            }
            return Err(error.into());
        }

        Ok(name)
    }

    async fn delete_temporary_identity(&self, namespace: &str, name: &str) -> Result<()> {
        // The account references the secret, so it goes first.
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        accounts.delete(name, &DeleteParams::default()).await?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::time::{Duration, Instant};

    use super::*;
    use crate::resources::{
        Condition, PipelineRunStatus, RunResult, TaskRunStatus, SUCCEEDED_CONDITION,
    };
    use crate::IMAGE_DIGEST_RESULT;

    #[derive(Clone)]
    enum Outcome {
        Succeed(Vec<RunResult>),
        Fail { reason: String, message: String },
    }

    /// In-memory executor: runs become terminal after `hold` elapses and
    /// every mutation is recorded for assertions.
    pub(crate) struct FakeExecutor {
        outcome: Outcome,
        hold: Duration,
        logs: String,
        counter: AtomicUsize,
        in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
        pub(crate) log_fetches: AtomicUsize,
        task_runs: Mutex<HashMap<String, (TaskRun, Instant)>>,
        pipeline_runs: Mutex<HashMap<String, (PipelineRun, Instant)>>,
        pub(crate) deleted: Mutex<Vec<String>>,
        tasks: Mutex<HashMap<String, Task>>,
        pipelines: Mutex<HashMap<String, Pipeline>>,
    }

    impl FakeExecutor {
        pub(crate) fn succeeding(digest: &str) -> Self {
            Self::new(Outcome::Succeed(vec![RunResult {
                name: IMAGE_DIGEST_RESULT.to_string(),
                value: digest.to_string(),
            }]))
        }

        pub(crate) fn failing(reason: &str, message: &str) -> Self {
            Self::new(Outcome::Fail {
                reason: reason.to_string(),
                message: message.to_string(),
            })
        }

        fn new(outcome: Outcome) -> Self {
            Self {
                outcome,
                hold: Duration::ZERO,
                logs: String::new(),
                counter: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                log_fetches: AtomicUsize::new(0),
                task_runs: Mutex::new(HashMap::new()),
                pipeline_runs: Mutex::new(HashMap::new()),
                deleted: Mutex::new(Vec::new()),
                tasks: Mutex::new(HashMap::new()),
                pipelines: Mutex::new(HashMap::new()),
            }
        }

        /// Keeps runs non-terminal for the given duration after creation.
        pub(crate) fn with_hold(mut self, hold: Duration) -> Self {
            self.hold = hold;
            self
        }

        pub(crate) fn with_logs(mut self, logs: &str) -> Self {
            self.logs = logs.to_string();
            self
        }

        pub(crate) fn with_task(self, name: &str, task: Task) -> Self {
            self.tasks.lock().unwrap().insert(name.to_string(), task);
            self
        }

        pub(crate) fn with_pipeline(self, name: &str, pipeline: Pipeline) -> Self {
            self.pipelines
                .lock()
                .unwrap()
                .insert(name.to_string(), pipeline);
            self
        }

        pub(crate) fn deleted_names(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }

        pub(crate) fn created_task_runs(&self) -> Vec<TaskRun> {
            self.task_runs
                .lock()
                .unwrap()
                .values()
                .map(|(run, _)| run.clone())
                .collect()
        }

        fn admit(&self) -> String {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            format!("fake-run-{n}")
        }

        fn conditions(&self) -> Vec<Condition> {
            match &self.outcome {
                Outcome::Succeed(_) => vec![Condition {
                    type_: SUCCEEDED_CONDITION.to_string(),
                    status: "True".to_string(),
                    reason: None,
                    message: None,
                }],
                Outcome::Fail { reason, message } => vec![Condition {
                    type_: SUCCEEDED_CONDITION.to_string(),
                    status: "False".to_string(),
                    reason: Some(reason.clone()),
                    message: Some(message.clone()),
                }],
            }
        }

        fn results(&self) -> Vec<RunResult> {
            match &self.outcome {
                Outcome::Succeed(results) => results.clone(),
                Outcome::Fail { .. } => vec![],
            }
        }
    }

    #[async_trait]
    impl JobExecutor for FakeExecutor {
        async fn create_task_run(&self, run: &TaskRun) -> Result<TaskRun> {
            let name = self.admit();
            let mut created = run.clone();
            created.metadata.name = Some(name.clone());
            self.task_runs
                .lock()
                .unwrap()
                .insert(name, (created.clone(), Instant::now() + self.hold));
            Ok(created)
        }

        async fn get_task_run(&self, _namespace: &str, name: &str) -> Result<TaskRun> {
            let (mut run, terminal_at) = self
                .task_runs
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_else(|| panic!("fake executor has no task run {name}"));
            if Instant::now() >= terminal_at {
                run.status = Some(TaskRunStatus {
                    conditions: self.conditions(),
                    task_results: self.results(),
                });
            }
            Ok(run)
        }

        async fn delete_task_run(&self, _namespace: &str, name: &str) -> Result<()> {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.deleted
                .lock()
                .unwrap()
                .push(format!("taskrun/{name}"));
            Ok(())
        }

        async fn task_run_logs(&self, _namespace: &str, _name: &str) -> Result<String> {
            self.log_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.logs.clone())
        }

        async fn create_pipeline_run(&self, run: &PipelineRun) -> Result<PipelineRun> {
            let name = self.admit();
            let mut created = run.clone();
            created.metadata.name = Some(name.clone());
            self.pipeline_runs
                .lock()
                .unwrap()
                .insert(name, (created.clone(), Instant::now() + self.hold));
            Ok(created)
        }

        async fn get_pipeline_run(&self, _namespace: &str, name: &str) -> Result<PipelineRun> {
            let (mut run, terminal_at) = self
                .pipeline_runs
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_else(|| panic!("fake executor has no pipeline run {name}"));
            if Instant::now() >= terminal_at {
                run.status = Some(PipelineRunStatus {
                    conditions: self.conditions(),
                    pipeline_results: self.results(),
                });
            }
            Ok(run)
        }

        async fn delete_pipeline_run(&self, _namespace: &str, name: &str) -> Result<()> {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.deleted
                .lock()
                .unwrap()
                .push(format!("pipelinerun/{name}"));
            Ok(())
        }

        async fn pipeline_run_logs(&self, _namespace: &str, _name: &str) -> Result<String> {
            self.log_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.logs.clone())
        }

        async fn get_task(&self, _namespace: &str, name: &str) -> Result<Task> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_else(|| panic!("fake executor has no task {name}")))
        }

        async fn get_pipeline(&self, _namespace: &str, name: &str) -> Result<Pipeline> {
            Ok(self
                .pipelines
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_else(|| panic!("fake executor has no pipeline {name}")))
        }

        async fn create_temporary_identity(
            &self,
            _namespace: &str,
            _registry: &str,
        ) -> Result<String> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("fake-identity-{n}"))
        }

        async fn delete_temporary_identity(&self, _namespace: &str, name: &str) -> Result<()> {
            self.deleted
                .lock()
                .unwrap()
                .push(format!("identity/{name}"));
            Ok(())
        }
    }
}
