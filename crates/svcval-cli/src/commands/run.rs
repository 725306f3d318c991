//! Run command
//!
//! Creates the namespace and base pods, runs the selected scenarios against
//! them in order, prints a summary and cleans up. Ctrl-C cancels the run:
//! in-flight validation is aborted and remaining scenarios are skipped, but
//! teardown and namespace deletion still happen.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use svcval_common::kube_utils::create_client;
use svcval_kube::{KubeExecutor, Manager, Services};
use svcval_matrix::{Model, NcProber, Prober, Validator};

use crate::config::{RunConfig, SVCVAL_CONFIG_ENV, SVCVAL_KUBECONFIG_ENV};
use crate::scenario::{run_all, Outcome, Scenario, ScenarioContext, ScenarioResult};
use crate::scenarios;
use crate::{Error, Result};

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Kubeconfig to use (defaults to kube's own resolution)
    #[arg(long, env = SVCVAL_KUBECONFIG_ENV)]
    pub kubeconfig: Option<PathBuf>,

    /// JSON run config
    #[arg(long, env = SVCVAL_CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Namespace for the test topology
    #[arg(long)]
    pub namespace: Option<String>,

    /// Scenario to run; repeat for several (default: all)
    #[arg(long = "scenario")]
    pub scenarios: Vec<String>,

    /// Probes in flight
    #[arg(long)]
    pub workers: Option<usize>,

    /// Bound for a single connection attempt
    #[arg(long)]
    pub probe_timeout_secs: Option<u64>,

    /// Leave the namespace in place after the run
    #[arg(long)]
    pub keep_namespace: bool,
}

impl RunArgs {
    /// Apply flag overrides on top of the file config
    fn apply(&self, config: &mut RunConfig) {
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if !self.scenarios.is_empty() {
            config.scenarios = self.scenarios.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(secs) = self.probe_timeout_secs {
            config.probe_timeout_secs = secs;
        }
    }
}

pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = RunConfig::resolve(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    let mut selected = scenarios::select(&config.scenarios)?;

    let client = create_client(args.kubeconfig.as_deref()).await?;
    let cleanup = Manager::new(client.clone());
    let namespace = config.namespace.clone();

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling run");
                cancel.cancel();
            }
        })
    };

    let results = execute(client, config, &mut selected, cancel).await;
    interrupt.abort();

    if args.keep_namespace {
        info!(namespace = %namespace, "Keeping namespace");
    } else if let Err(e) = cleanup.delete_namespace(&namespace).await {
        warn!(namespace = %namespace, error = %e, "Failed to delete namespace");
    }

    let results = results?;
    print!("{}", render_summary(&results));

    let failed = results.iter().filter(|r| r.outcome.is_failure()).count();
    if failed > 0 {
        return Err(Error::ScenariosFailed {
            failed,
            total: results.len(),
        });
    }
    Ok(())
}

/// Bring up the topology and run every selected scenario against it
async fn execute(
    client: Client,
    config: RunConfig,
    selected: &mut [Box<dyn Scenario>],
    cancel: CancellationToken,
) -> Result<Vec<ScenarioResult>> {
    let manager = Manager::new(client.clone());
    manager.init_namespace(&config.namespace).await?;

    let mut model = Model::new(&[&config.namespace], &config.pod_names, &config.containers())?;
    let stalled = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(svcval_common::Error::internal_with_context("initialize", "run cancelled").into());
        }
        stalled = manager.initialize_model(&mut model) => stalled?,
    };
    if !stalled.is_empty() {
        warn!(stalled = ?stalled, "Continuing without pods that never started");
    }
    if model.is_empty() {
        return Err(Error::validation("no test pod became ready"));
    }

    let prober: Arc<dyn Prober> = Arc::new(NcProber::new(Arc::new(KubeExecutor::new(client))));
    let validator = Validator::new(prober.clone(), config.validator_config());
    let mut ctx = ScenarioContext {
        manager,
        model,
        validator,
        prober,
        services: Services::new(),
        config,
        cancel,
    };
    Ok(run_all(selected, &mut ctx).await)
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.1}s", elapsed.as_secs_f64())
}

/// Fixed-width table of scenario outcomes
fn render_summary(results: &[ScenarioResult]) -> String {
    let width = results
        .iter()
        .map(|r| r.name.len())
        .chain(std::iter::once("SCENARIO".len()))
        .max()
        .unwrap_or(0);

    let mut out = format!("\n{:<width$}  {:>8}  OUTCOME\n", "SCENARIO", "ELAPSED");
    for r in results {
        out.push_str(&format!(
            "{:<width$}  {:>8}  {}\n",
            r.name,
            format_elapsed(r.elapsed),
            r.outcome
        ));
    }

    let count = |f: fn(&Outcome) -> bool| results.iter().filter(|r| f(&r.outcome)).count();
    out.push_str(&format!(
        "\n{} passed, {} warned, {} failed, {} errored\n",
        count(|o| matches!(o, Outcome::Passed)),
        count(|o| matches!(o, Outcome::Warned(_))),
        count(|o| matches!(o, Outcome::Failed(_))),
        count(|o| matches!(o, Outcome::Errored(_))),
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: RunArgs,
    }

    #[test]
    fn flags_override_file_values() {
        let harness = Harness::try_parse_from([
            "svcval",
            "--namespace",
            "svc-e2e",
            "--scenario",
            "hairpin",
            "--scenario",
            "endless",
            "--workers",
            "3",
        ])
        .unwrap();

        let mut config = RunConfig {
            probe_timeout_secs: 4,
            ..Default::default()
        };
        harness.args.apply(&mut config);
        assert_eq!(config.namespace, "svc-e2e");
        assert_eq!(config.scenarios, vec!["hairpin", "endless"]);
        assert_eq!(config.workers, 3);
        assert_eq!(config.probe_timeout_secs, 4);
        assert!(!harness.args.keep_namespace);
    }

    #[test]
    fn no_flags_leave_config_alone() {
        let mut config = RunConfig::default();
        RunArgs::default().apply(&mut config);
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn summary_lists_every_scenario_and_totals() {
        let results = vec![
            ScenarioResult {
                name: "cluster-ip".into(),
                outcome: Outcome::Passed,
                elapsed: Duration::from_millis(4200),
            },
            ScenarioResult {
                name: "session-affinity".into(),
                outcome: Outcome::Warned(vec!["drift".into()]),
                elapsed: Duration::from_secs(12),
            },
            ScenarioResult {
                name: "hairpin".into(),
                outcome: Outcome::Errored("setup: timed out".into()),
                elapsed: Duration::ZERO,
            },
        ];
        let table = render_summary(&results);
        assert!(table.contains("cluster-ip            4.2s  PASS"));
        assert!(table.contains("WARN (drift)"));
        assert!(table.contains("ERROR (setup: timed out)"));
        assert!(table.contains("1 passed, 1 warned, 0 failed, 1 errored"));
    }
}
