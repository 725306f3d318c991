//! Validator: reconcile a test case's expectations against live probes
//!
//! One call to [`Validator::validate`] runs a test case to completion:
//!
//! 1. resolve a target (address, port) for every ordered pair
//! 2. probe every pair with bounded parallelism
//! 3. record each observation exactly once, from the collecting task
//! 4. apply the traffic-local and affinity policies
//! 5. reduce the matrix to a wrong count in a single pass
//!
//! Probe execution failures are collected per pair and reported next to the
//! wrong count so that a tooling problem never masquerades as a clean run.
//! Cancellation drops every outstanding probe and returns
//! [`Error::Aborted`] instead of a partial count.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use svcval_common::Error;

use crate::model::{Model, PodKey};
use crate::probe::{ProbeError, ProbeOutcome, ProbeRequest, Prober};
use crate::reachability::{Reachability, Summary};
use crate::test_case::TestCase;

/// Default number of probes in flight
pub const DEFAULT_WORKERS: usize = 8;

/// Default bound for a single connection attempt
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Validator tuning
#[derive(Clone, Debug)]
pub struct ValidatorConfig {
    /// Maximum probes (or, in affinity mode, sources) in flight
    pub workers: usize,
    /// Bound for a single connection attempt
    pub probe_timeout: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// A pair whose probe could not be executed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeFailure {
    /// Source pod
    pub from: PodKey,
    /// Destination pod
    pub to: PodKey,
    /// What went wrong
    pub error: ProbeError,
}

/// Result of one validation run
#[derive(Clone, Debug)]
pub struct ValidationReport {
    /// Pairs where expected != observed
    pub wrong: usize,
    /// Pairs whose probe could not be executed
    pub errors: usize,
    /// Details of every execution failure
    pub error_pairs: Vec<ProbeFailure>,
    /// Every mismatching pair
    pub wrong_pairs: Vec<(PodKey, PodKey)>,
    /// Matrix aggregate
    pub summary: Summary,
    /// The populated matrix
    pub reachability: Reachability,
}

impl ValidationReport {
    /// No mismatches and no execution failures
    pub fn is_clean(&self) -> bool {
        self.wrong == 0 && self.errors == 0
    }

    /// Some probes could not run, so the wrong count is not trustworthy
    pub fn is_inconclusive(&self) -> bool {
        self.errors > 0
    }
}

struct PairJob {
    from: PodKey,
    to: PodKey,
    request: Option<ProbeRequest>,
}

enum PairResult {
    /// The destination has no address for this service flavor
    Unresolved,
    Probed(Result<ProbeOutcome, ProbeError>),
}

/// Drives probes for test cases
pub struct Validator {
    prober: Arc<dyn Prober>,
    config: ValidatorConfig,
}

impl Validator {
    /// Create a validator
    pub fn new(prober: Arc<dyn Prober>, config: ValidatorConfig) -> Self {
        Self { prober, config }
    }

    /// The prober this validator drives
    pub fn prober(&self) -> Arc<dyn Prober> {
        self.prober.clone()
    }

    /// Tuning in use
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Run a test case against the current topology
    ///
    /// Errors before any probing when the case does not fit the model
    /// (pods missing, no designated traffic-local endpoint). Returns
    /// [`Error::Aborted`] if `cancel` fires before every pair is probed.
    pub async fn validate(
        &self,
        model: &Model,
        case: TestCase,
        cancel: &CancellationToken,
    ) -> Result<ValidationReport, Error> {
        let TestCase {
            protocol,
            service_type,
            traffic_local,
            session_affinity,
            mut reachability,
            ..
        } = case.clone();

        for key in reachability.peers() {
            if model.get(key).is_none() {
                return Err(Error::validation(format!(
                    "pod {} is in the matrix but not in the model",
                    key
                )));
            }
        }

        if traffic_local {
            apply_traffic_local(model, &mut reachability)?;
        }

        let jobs = self.plan(model, &case, &reachability)?;
        reachability.clear_observations();

        info!(
            service_type = %service_type,
            protocol = %protocol,
            port = ?case.to_port,
            pairs = jobs.len(),
            traffic_local,
            session_affinity,
            "Validating reachability"
        );

        let results = self.run(jobs, session_affinity, cancel).await?;

        let mut error_pairs = Vec::new();
        for (job, result) in results {
            let connected = match result {
                PairResult::Unresolved => false,
                PairResult::Probed(Ok(outcome)) => {
                    if session_affinity {
                        outcome.connected && outcome.endpoint.as_deref() == Some(job.to.name.as_str())
                    } else {
                        outcome.connected
                    }
                }
                PairResult::Probed(Err(error)) => {
                    warn!(from = %job.from, to = %job.to, error = %error, "Probe could not run");
                    error_pairs.push(ProbeFailure {
                        from: job.from.clone(),
                        to: job.to.clone(),
                        error,
                    });
                    false
                }
            };
            reachability.observe(&job.from, &job.to, connected)?;
        }

        let summary = reachability.summary();
        let wrong_pairs = reachability.wrong_pairs();
        debug!("expected:\n{}", reachability.render_expected());
        debug!("observed:\n{}", reachability.render_observed());

        info!(
            wrong = summary.wrong,
            errors = error_pairs.len(),
            total = summary.total,
            "Validation finished"
        );

        Ok(ValidationReport {
            wrong: summary.wrong,
            errors: error_pairs.len(),
            error_pairs,
            wrong_pairs,
            summary,
            reachability,
        })
    }

    /// Run a test case and return its wrong count, logging mismatches
    pub async fn validate_or_fail(
        &self,
        model: &Model,
        case: TestCase,
        cancel: &CancellationToken,
    ) -> Result<usize, Error> {
        let report = self.validate(model, case, cancel).await?;
        if report.wrong > 0 {
            warn!(
                wrong = report.wrong,
                "Reachability mismatch:\n{}",
                report.reachability.render_comparison()
            );
        }
        if report.is_inconclusive() {
            warn!(errors = report.errors, "Validation inconclusive: some probes could not run");
        }
        Ok(report.wrong)
    }

    fn plan(
        &self,
        model: &Model,
        case: &TestCase,
        reachability: &Reachability,
    ) -> Result<Vec<PairJob>, Error> {
        let mut jobs = Vec::with_capacity(reachability.pair_count());
        for (from, to) in reachability.pairs() {
            let (Some(source), Some(destination)) = (model.get(from), model.get(to)) else {
                return Err(Error::validation(format!(
                    "pair {} -> {} references a pod missing from the model",
                    from, to
                )));
            };
            let request = match case.resolve(destination) {
                Some((address, port)) => Some(ProbeRequest::from_pod(
                    source,
                    address,
                    port,
                    case.protocol,
                    self.config.probe_timeout,
                )?),
                None => {
                    debug!(to = %to, service_type = %case.service_type, "Destination has no target");
                    None
                }
            };
            jobs.push(PairJob {
                from: from.clone(),
                to: to.clone(),
                request,
            });
        }
        Ok(jobs)
    }

    async fn run(
        &self,
        jobs: Vec<PairJob>,
        session_affinity: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<(PairJob, PairResult)>, Error> {
        let total = jobs.len();

        // Affinity probes from one source must run in order; everything
        // else is independent.
        let groups: Vec<Vec<PairJob>> = if session_affinity {
            let mut groups: Vec<Vec<PairJob>> = Vec::new();
            for job in jobs {
                match groups.last_mut() {
                    Some(group) if group[0].from == job.from => group.push(job),
                    _ => groups.push(vec![job]),
                }
            }
            groups
        } else {
            jobs.into_iter().map(|job| vec![job]).collect()
        };

        let prober = self.prober.clone();
        let mut pending = stream::iter(groups)
            .map(move |group| {
                let prober = prober.clone();
                async move {
                    let mut results = Vec::with_capacity(group.len());
                    for job in group {
                        let result = match &job.request {
                            Some(request) => PairResult::Probed(prober.probe(request).await),
                            None => PairResult::Unresolved,
                        };
                        results.push((job, result));
                    }
                    results
                }
            })
            .buffer_unordered(self.config.workers.max(1));

        let mut results = Vec::with_capacity(total);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(completed = results.len(), total, "Validation cancelled");
                    return Err(Error::aborted(results.len(), total));
                }
                batch = pending.next() => match batch {
                    Some(batch) => results.extend(batch),
                    None => break,
                },
            }
        }
        Ok(results)
    }
}

/// Expect nothing to reach destinations that are not designated endpoints
fn apply_traffic_local(model: &Model, reachability: &mut Reachability) -> Result<(), Error> {
    let peers = reachability.peers().to_vec();
    let designated: Vec<&PodKey> = peers
        .iter()
        .filter(|k| model.get(k).is_some_and(|p| p.is_local_endpoint()))
        .collect();
    if designated.is_empty() {
        return Err(Error::validation(
            "traffic-local case has no designated endpoint in the model",
        ));
    }
    debug!(designated = ?designated, "Applying traffic-local policy");
    for key in &peers {
        if !designated.contains(&key) {
            reachability.force_unexpected_destination(key)?;
        }
    }
    Ok(())
}
