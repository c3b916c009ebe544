//! TestRun controller implementation
//!
//! Each reconciliation reloads the run, performs at most one forward-moving
//! action for its current stage and persists the result through
//! [`update_status`]. Stages advance
//! `"" → initialization → initialized → created → started → stopped → finished`,
//! with `error` reachable from any non-terminal stage.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use loadrun_common::crd::{CleanupPolicy, ConditionStatus, ConditionType, Stage, TestRun};
use loadrun_common::metrics::{ReconcileResult, ReconcileTimer};
use loadrun_common::{Error, Result};

use crate::client::{KubeClient, KubeClientImpl};
use crate::cloud::{CloudClientFactory, CloudCoordinator, HttpCloudClientFactory};
use crate::lifecycle::{RunLifecycle, StandardLifecycle};
use crate::resources::DEFAULT_RUNNER_IMAGE;
use crate::runner::{HttpRunnerClient, RunnerClient};
use crate::status::update_status;
use crate::workers;

/// Delay before re-checking a dependency that is not ready yet
const SHORT_REQUEUE: Duration = Duration::from_secs(1);
/// Delay between attempts to resume runners that are still starting
const START_REQUEUE: Duration = Duration::from_secs(5);
/// Delay between runner status polls while a test is executing
const RUNNING_REQUEUE: Duration = Duration::from_secs(15);
/// Delay after an error that should clear on its own
const RETRY_REQUEUE: Duration = Duration::from_secs(5);
/// Delay after an error that needs a spec change or a human
const FAILED_REQUEUE: Duration = Duration::from_secs(300);

/// Tunables for the controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Timeout for each runner REST call
    pub probe_timeout: Duration,
    /// Timeout for each cloud API call
    pub cloud_timeout: Duration,
    /// Deadline for one whole reconciliation
    pub reconcile_timeout: Duration,
    /// Runner image used when a TestRun does not name one
    pub runner_image: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            cloud_timeout: loadrun_cloud::client::DEFAULT_TIMEOUT,
            reconcile_timeout: Duration::from_secs(120),
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
        }
    }
}

/// Controller context shared by every reconciliation
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Client for the runners' REST API
    pub runner: Arc<dyn RunnerClient>,
    /// Stage side effects
    pub lifecycle: Arc<dyn RunLifecycle>,
    /// Shared cloud client and the checks built on it
    pub cloud: CloudCoordinator,
    /// Deadline for one reconciliation
    pub reconcile_timeout: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        runner: Arc<dyn RunnerClient>,
        lifecycle: Arc<dyn RunLifecycle>,
        cloud_factory: Arc<dyn CloudClientFactory>,
    ) -> Self {
        Self {
            kube,
            runner,
            lifecycle,
            cloud: CloudCoordinator::new(cloud_factory),
            reconcile_timeout: ControllerConfig::default().reconcile_timeout,
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(ControllerConfig { runner_image, ..Default::default() })
///     .build()?;
/// ```
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
    kube: Option<Arc<dyn KubeClient>>,
    runner: Option<Arc<dyn RunnerClient>>,
    lifecycle: Option<Arc<dyn RunLifecycle>>,
    cloud_factory: Option<Arc<dyn CloudClientFactory>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: ControllerConfig::default(),
            kube: None,
            runner: None,
            lifecycle: None,
            cloud_factory: None,
        }
    }

    /// Set the controller tunables
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the runner client
    pub fn runner_client(mut self, runner: Arc<dyn RunnerClient>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Override the stage side effects
    pub fn lifecycle(mut self, lifecycle: Arc<dyn RunLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Override how cloud clients are built
    pub fn cloud_factory(mut self, factory: Arc<dyn CloudClientFactory>) -> Self {
        self.cloud_factory = Some(factory);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context> {
        let config = self.config;
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let runner: Arc<dyn RunnerClient> = match self.runner {
            Some(runner) => runner,
            None => Arc::new(HttpRunnerClient::new(config.probe_timeout)?),
        };
        let lifecycle = self.lifecycle.unwrap_or_else(|| {
            Arc::new(StandardLifecycle::new(
                kube.clone(),
                runner.clone(),
                config.runner_image.clone(),
            ))
        });
        let cloud_factory = self
            .cloud_factory
            .unwrap_or_else(|| Arc::new(HttpCloudClientFactory::new(config.cloud_timeout)));

        Ok(Context {
            kube,
            runner,
            lifecycle,
            cloud: CloudCoordinator::new(cloud_factory),
            reconcile_timeout: config.reconcile_timeout,
        })
    }
}

/// Reconcile a TestRun
///
/// Returns the scheduling directive for the next pass: `await_change` when
/// the status write will trigger one, a delayed requeue while waiting on
/// runners or the cloud.
#[instrument(skip(run, ctx), fields(run = %run.name_any()))]
pub async fn reconcile(run: Arc<TestRun>, ctx: Arc<Context>) -> Result<Action> {
    let timer = ReconcileTimer::start(stage_label(&run.stage()));
    let deadline = ctx.reconcile_timeout;

    let result = match tokio::time::timeout(deadline, reconcile_run(&run, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Cancelled {
            run: run.name_any(),
            after: deadline,
        }),
    };

    timer.finish(if result.is_ok() {
        ReconcileResult::Success
    } else {
        ReconcileResult::Error
    });
    result
}

/// Requeue policy for failed reconciliations
pub fn error_policy(run: Arc<TestRun>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_conflict() {
        debug!(run = %run.name_any(), "TestRun changed during reconciliation, retrying");
        return Action::requeue(SHORT_REQUEUE);
    }

    error!(
        ?error,
        run = %run.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(RETRY_REQUEUE)
    } else {
        Action::requeue(FAILED_REQUEUE)
    }
}

fn stage_label(stage: &Stage) -> String {
    match stage {
        Stage::Unset => "unset".to_string(),
        Stage::Invalid(_) => "invalid".to_string(),
        other => other.as_str().to_string(),
    }
}

async fn reconcile_run(obj: &TestRun, ctx: &Context) -> Result<Action> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "TestRun must be namespaced"))?;

    let Some(mut run) = ctx.kube.get_test_run(&namespace, &name).await? else {
        debug!("TestRun not found, nothing to do");
        return Ok(Action::await_change());
    };

    let stage = run.stage();
    if run.is_true(ConditionType::CloudPLZTestRun) && !stage.is_terminal() {
        match ctx.cloud.ensure_client(ctx.kube.as_ref(), &run).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!("cloud token not available yet");
                return Ok(Action::requeue(SHORT_REQUEUE));
            }
            Err(e @ Error::Validation { .. }) => {
                warn!(error = %e, "cloud token is unusable");
                return advance(&mut run, ctx, Stage::Error).await;
            }
            Err(e) => return Err(e),
        }
    }

    debug!(stage = %stage, "reconciling TestRun");

    match stage {
        Stage::Unset => initialize(&mut run, ctx).await,
        Stage::Initialization => initialization(&mut run, ctx).await,
        Stage::Initialized => initialized(&mut run, ctx).await,
        Stage::Created => created(&mut run, ctx).await,
        Stage::Started => started(&mut run, ctx).await,
        Stage::Stopped => stopped(&mut run, ctx).await,
        Stage::Finished | Stage::Error => cleanup(&run, ctx).await,
        Stage::Invalid(stage) => {
            error!(stage = %stage, "TestRun has an invalid stage");
            Err(Error::invalid_stage(&name, stage))
        }
    }
}

async fn advance(run: &mut TestRun, ctx: &Context, stage: Stage) -> Result<Action> {
    run.set_stage(stage);
    update_status(ctx.kube.as_ref(), run).await?;
    Ok(Action::await_change())
}

async fn initialize(run: &mut TestRun, ctx: &Context) -> Result<Action> {
    info!("initializing TestRun");
    run.initialize();
    update_status(ctx.kube.as_ref(), run).await?;
    advance(run, ctx, Stage::Initialization).await
}

async fn initialization(run: &mut TestRun, ctx: &Context) -> Result<Action> {
    match run.condition(ConditionType::CloudTestRun) {
        ConditionStatus::Unknown => validate(run, ctx).await,
        ConditionStatus::False => advance(run, ctx, Stage::Initialized).await,
        ConditionStatus::True if run.is_true(ConditionType::CloudTestRunCreated) => {
            advance(run, ctx, Stage::Initialized).await
        }
        ConditionStatus::True => create_cloud_test_run(run, ctx).await,
    }
}

async fn validate(run: &mut TestRun, ctx: &Context) -> Result<Action> {
    match ctx.lifecycle.validate(run).await {
        Ok(validation) => {
            if validation.cloud_output {
                run.update_condition(ConditionType::CloudTestRun, ConditionStatus::True);
                if run.is_false(ConditionType::CloudPLZTestRun) {
                    run.update_condition(ConditionType::CloudTestRunCreated, ConditionStatus::False);
                    run.update_condition(
                        ConditionType::CloudTestRunFinalized,
                        ConditionStatus::False,
                    );
                }
            } else {
                run.update_condition(ConditionType::CloudTestRun, ConditionStatus::False);
            }
            update_status(ctx.kube.as_ref(), run).await?;
            Ok(Action::await_change())
        }
        Err(e @ Error::Validation { .. }) => {
            warn!(error = %e, "TestRun failed validation");
            advance(run, ctx, Stage::Error).await
        }
        Err(e) => Err(e),
    }
}

async fn create_cloud_test_run(run: &mut TestRun, ctx: &Context) -> Result<Action> {
    let client = match ctx.cloud.ensure_client(ctx.kube.as_ref(), run).await {
        Ok(Some(client)) => client,
        Ok(None) => {
            info!("cloud token not available yet");
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
        Err(e @ Error::Validation { .. }) => {
            warn!(error = %e, "cloud token is unusable");
            return advance(run, ctx, Stage::Error).await;
        }
        Err(e) => return Err(e),
    };

    let test_run_id = ctx.lifecycle.create_cloud_test_run(run, client).await?;
    info!(test_run_id = %test_run_id, "cloud test run created");

    run.status_mut().test_run_id = test_run_id;
    run.update_condition(ConditionType::CloudTestRunCreated, ConditionStatus::True);
    update_status(ctx.kube.as_ref(), run).await?;
    Ok(Action::await_change())
}

async fn initialized(run: &mut TestRun, ctx: &Context) -> Result<Action> {
    ctx.lifecycle.create_workers(run).await?;
    advance(run, ctx, Stage::Created).await
}

async fn created(run: &mut TestRun, ctx: &Context) -> Result<Action> {
    if !ctx.lifecycle.start_workers(run).await? {
        return Ok(Action::requeue(START_REQUEUE));
    }
    run.update_condition(ConditionType::TestRunRunning, ConditionStatus::True);
    advance(run, ctx, Stage::Started).await
}

async fn started(run: &mut TestRun, ctx: &Context) -> Result<Action> {
    // a late event after the run was wrapped up
    if (run.is_true(ConditionType::CloudTestRun)
        && run.is_true(ConditionType::CloudTestRunFinalized))
        || run.is_true(ConditionType::CloudTestRunAborted)
    {
        debug!("TestRun already finalized or aborted");
        return Ok(Action::await_change());
    }

    let all_stopped = workers::poll_stopped(ctx.kube.as_ref(), ctx.runner.as_ref(), run).await?;
    if !all_stopped {
        if run.is_true(ConditionType::CloudPLZTestRun)
            && run.is_false(ConditionType::CloudTestRunAborted)
            && ctx.cloud.should_abort(run).await
        {
            warn!(test_run_id = %run.test_run_id(), "cloud aborted the test run");
            // TestRunRunning stays true so the stopped stage halts and tears down the runners
            return advance(run, ctx, Stage::Stopped).await;
        }
        return Ok(Action::requeue(RUNNING_REQUEUE));
    }

    info!("all runners stopped");
    run.update_condition(ConditionType::TestRunRunning, ConditionStatus::False);
    advance(run, ctx, Stage::Stopped).await
}

async fn stopped(run: &mut TestRun, ctx: &Context) -> Result<Action> {
    let name = run.name_any();
    let forced_abort = run.is_true(ConditionType::CloudPLZTestRun)
        && run.is_false(ConditionType::CloudTestRunAborted)
        && run.is_true(ConditionType::TestRunRunning);

    if forced_abort {
        if !workers::poll_stopped(ctx.kube.as_ref(), ctx.runner.as_ref(), run).await? {
            info!("stopping runners of aborted TestRun");
            ctx.lifecycle.stop_workers(run).await?;
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
        workers::kill_all(ctx.kube.as_ref(), run)
            .await?
            .into_result(&name)?;
        info!("runners of aborted TestRun deleted");
        run.update_condition(ConditionType::CloudTestRunAborted, ConditionStatus::True);
        run.update_condition(ConditionType::TestRunRunning, ConditionStatus::False);
        update_status(ctx.kube.as_ref(), run).await?;
    }

    if run.is_true(ConditionType::CloudTestRun)
        && !run.is_true(ConditionType::CloudTestRunFinalized)
    {
        if ctx
            .cloud
            .ensure_client(ctx.kube.as_ref(), run)
            .await?
            .is_none()
        {
            info!("cloud token not available yet");
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
        if let Err(e) = ctx.cloud.finalize(run).await {
            error!(error = %e, test_run_id = %run.test_run_id(), "failed to finalize cloud test run");
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
        info!(test_run_id = %run.test_run_id(), "cloud test run finalized");
        run.update_condition(ConditionType::CloudTestRunFinalized, ConditionStatus::True);
        update_status(ctx.kube.as_ref(), run).await?;
    }

    run.set_stage(Stage::Finished);
    update_status(ctx.kube.as_ref(), run).await?;
    Ok(Action::requeue(SHORT_REQUEUE))
}

async fn cleanup(run: &TestRun, ctx: &Context) -> Result<Action> {
    if run.spec.cleanup == CleanupPolicy::Post {
        let namespace = run.namespace().unwrap_or_default();
        info!(stage = %run.stage(), "deleting completed TestRun");
        ctx.kube.delete_test_run(&namespace, &run.name_any()).await?;
    }
    Ok(Action::await_change())
}
