//! Scenario harness
//!
//! A scenario sets up services for one service flavor, asserts the
//! reachability it expects through them, and tears everything down again.
//! All state a scenario touches lives in an explicit [`ScenarioContext`]
//! passed through each phase.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use svcval_common::Error;
use svcval_kube::{Manager, ServiceHandle, Services};
use svcval_matrix::{
    Model, Prober, Protocol, Reachability, ServiceType, TestCase, ValidationReport, Validator,
};

use crate::config::RunConfig;

/// Everything a scenario may read or change
pub struct ScenarioContext {
    pub manager: Manager,
    pub model: Model,
    pub validator: Validator,
    pub prober: Arc<dyn Prober>,
    pub services: Services,
    pub config: RunConfig,
    pub cancel: CancellationToken,
}

impl ScenarioContext {
    /// Namespace of the base topology
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Handle for a service manifest, not yet created
    pub fn service(&self, spec: Service) -> ServiceHandle {
        ServiceHandle::new(self.manager.client().clone(), spec)
            .with_wait(self.manager.wait_config().clone())
    }

    /// Test case over every pod currently in the model
    pub fn case(&self, protocol: Protocol, default: bool, service_type: ServiceType) -> TestCase {
        TestCase::new(
            protocol,
            Reachability::new(self.model.all_pods(), default),
            service_type,
        )
    }

    /// Run a test case against the current model
    pub async fn validate(&self, case: TestCase) -> Result<ValidationReport, Error> {
        self.validator.validate(&self.model, case, &self.cancel).await
    }

    /// Delete the scenario's services and clear per-test pod attributes
    pub async fn reset_test_board(&mut self) -> Result<(), Error> {
        let deleted = self.services.delete_all().await;
        self.model.reset_all_pods();
        deleted
    }

    /// Wait that respects cancellation
    pub async fn pause(&self, delay: Duration) -> Result<(), Error> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::internal_with_context("pause", "run cancelled")),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Findings of an assess phase
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub failures: Vec<String>,
    pub warnings: Vec<String>,
}

impl Assessment {
    /// Record a failure unless the report is clean
    ///
    /// Mismatches fail the check; probes that could not run make it
    /// inconclusive, which also fails it.
    pub fn expect_no_wrong(&mut self, check: &str, report: &ValidationReport) {
        if report.wrong > 0 {
            warn!(
                check,
                wrong = report.wrong,
                "Reachability mismatch:\n{}",
                report.reachability.render_comparison()
            );
            self.failures
                .push(format!("{}: {} wrong", check, report.wrong));
        }
        if report.is_inconclusive() {
            for failure in &report.error_pairs {
                warn!(check, from = %failure.from, to = %failure.to, error = %failure.error, "Probe did not run");
            }
            self.failures.push(format!(
                "{}: inconclusive, {} probes could not run",
                check, report.errors
            ));
        }
        if report.is_clean() {
            info!(check, pairs = report.summary.total, "Check passed");
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failures.push(reason.into());
    }

    pub fn warn(&mut self, reason: impl Into<String>) {
        self.warnings.push(reason.into());
    }

    pub fn into_outcome(self) -> Outcome {
        if !self.failures.is_empty() {
            Outcome::Failed(self.failures)
        } else if !self.warnings.is_empty() {
            Outcome::Warned(self.warnings)
        } else {
            Outcome::Passed
        }
    }
}

/// How a scenario ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(Vec<String>),
    Warned(Vec<String>),
    Errored(String),
}

impl Outcome {
    /// Whether the run should exit non-zero because of this outcome
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_) | Outcome::Errored(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "PASS"),
            Outcome::Failed(reasons) => write!(f, "FAIL ({})", reasons.join("; ")),
            Outcome::Warned(reasons) => write!(f, "WARN ({})", reasons.join("; ")),
            Outcome::Errored(message) => write!(f, "ERROR ({})", message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub name: String,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// A setup/assess/teardown unit
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Scenario: Send {
    /// Catalogue name, used with `--scenario`
    fn name(&self) -> &'static str;

    /// Short `key=value` label describing what is exercised
    fn label(&self) -> &'static str;

    /// One-line description for `svcval list`
    fn description(&self) -> &'static str;

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error>;

    async fn assess(&mut self, ctx: &mut ScenarioContext) -> Result<Assessment, Error>;

    async fn teardown(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error>;
}

/// Run one scenario through all three phases
///
/// Teardown always runs, including after a failed setup. A teardown error
/// only changes the outcome of a scenario that otherwise passed.
pub async fn run_scenario(
    scenario: &mut dyn Scenario,
    ctx: &mut ScenarioContext,
) -> ScenarioResult {
    let name = scenario.name();
    let started = Instant::now();
    info!(scenario = name, label = scenario.label(), "Setting up scenario");

    let mut outcome = match scenario.setup(ctx).await {
        Err(e) => {
            error!(scenario = name, error = %e, "Setup failed");
            Outcome::Errored(format!("setup: {}", e))
        }
        Ok(()) => {
            info!(scenario = name, "Assessing scenario");
            match scenario.assess(ctx).await {
                Ok(assessment) => assessment.into_outcome(),
                Err(e) => {
                    error!(scenario = name, error = %e, "Assess failed");
                    Outcome::Errored(format!("assess: {}", e))
                }
            }
        }
    };

    if let Err(e) = scenario.teardown(ctx).await {
        warn!(scenario = name, error = %e, "Teardown failed");
        if !outcome.is_failure() {
            outcome = Outcome::Errored(format!("teardown: {}", e));
        }
    }

    let elapsed = started.elapsed();
    info!(scenario = name, outcome = %outcome, elapsed = ?elapsed, "Scenario finished");
    ScenarioResult {
        name: name.to_string(),
        outcome,
        elapsed,
    }
}

/// Run scenarios in order, skipping the rest once the run is cancelled
pub async fn run_all(
    scenarios: &mut [Box<dyn Scenario>],
    ctx: &mut ScenarioContext,
) -> Vec<ScenarioResult> {
    let mut results = Vec::with_capacity(scenarios.len());
    for scenario in scenarios.iter_mut() {
        if ctx.cancel.is_cancelled() {
            results.push(ScenarioResult {
                name: scenario.name().to_string(),
                outcome: Outcome::Errored("run cancelled".to_string()),
                elapsed: Duration::ZERO,
            });
            continue;
        }
        results.push(run_scenario(scenario.as_mut(), ctx).await);
    }
    results
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use svcval_matrix::{
        Container, ProbeError, ProbeOutcome, ProbeRequest, ValidatorConfig,
    };

    /// Answers every probe as connected from the pod the address belongs to
    pub struct EchoProber;

    #[async_trait]
    impl Prober for EchoProber {
        async fn probe(&self, request: &ProbeRequest) -> Result<ProbeOutcome, ProbeError> {
            Ok(ProbeOutcome {
                connected: true,
                endpoint: Some(request.address.clone()),
                command: String::new(),
            })
        }
    }

    /// Context over an unreachable API server; only the model and prober
    /// are usable.
    pub fn context() -> ScenarioContext {
        let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        let mut model =
            Model::new(&["x"], &["pod-1", "pod-2"], &[Container::new(80, Protocol::Tcp)]).unwrap();
        for (i, pod) in model.all_pods_mut().enumerate() {
            pod.set_pod_ip(format!("10.244.0.{}", i + 1));
        }
        let prober: Arc<dyn Prober> = Arc::new(EchoProber);
        ScenarioContext {
            manager: Manager::new(client),
            model,
            validator: Validator::new(prober.clone(), ValidatorConfig::default()),
            prober,
            services: Services::new(),
            config: RunConfig {
                namespace: "x".into(),
                ..Default::default()
            },
            cancel: CancellationToken::new(),
        }
    }
}
