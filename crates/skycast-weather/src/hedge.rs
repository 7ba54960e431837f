//! Latency-hedged invocation of the provider chain.
//!
//! The primary provider runs alone until `primary_max_duration` elapses.
//! Only then is the next provider started alongside it, and the first
//! success wins. On the common fast path the secondary is never called.
//!
//! A leg that fails frees its place for the next unstarted provider, so the
//! chain is walked in priority order. When every started provider fails the
//! error of the provider with the highest chain index is returned, which
//! keeps the outcome independent of completion timing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::deadline::Deadline;
use crate::error::{ForecastError, TimeoutStage};
use crate::provider::{ForecastProvider, ProviderChain};
use crate::types::{ForecastDay, ForecastRequest};

/// Result of one hedge leg.
#[derive(Debug)]
pub enum ProviderOutcome {
    Success(Vec<ForecastDay>),
    Failure(ForecastError),
}

impl From<Result<Vec<ForecastDay>, ForecastError>> for ProviderOutcome {
    fn from(result: Result<Vec<ForecastDay>, ForecastError>) -> Self {
        match result {
            Ok(days) => Self::Success(days),
            Err(err) => Self::Failure(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HedgedInvoker {
    primary_max_duration: Duration,
}

impl HedgedInvoker {
    pub fn new(primary_max_duration: Duration) -> Self {
        Self {
            primary_max_duration,
        }
    }

    /// Fetch `request` from `chain`, hedging the primary after the threshold.
    ///
    /// All legs run under a child scope of `deadline`; the scope is cancelled
    /// before this returns and losing legs are aborted and reaped.
    pub async fn fetch(
        &self,
        request: &ForecastRequest,
        chain: &ProviderChain,
        deadline: &Deadline,
    ) -> Result<Vec<ForecastDay>, ForecastError> {
        let providers = chain.providers();
        if providers.is_empty() {
            return Err(ForecastError::UpstreamUnavailable(Box::new(
                ForecastError::upstream("chain", "no providers configured"),
            )));
        }

        let started_at = Instant::now();
        let scope = deadline.child();
        let _cancel_losers = scope.token().clone().drop_guard();

        let mut legs: JoinSet<(usize, ProviderOutcome)> = JoinSet::new();
        let mut failures: Vec<(usize, ForecastError)> = Vec::new();

        spawn_leg(&mut legs, &providers[0], 0, request, &scope);
        let mut next = 1;
        let mut primary_running = true;

        let hedge_timer = tokio::time::sleep(self.primary_max_duration);
        tokio::pin!(hedge_timer);

        let result = loop {
            tokio::select! {
                biased;
                _ = deadline.token().cancelled() => {
                    tracing::debug!("Forecast for {} cancelled by caller", request);
                    break Err(ForecastError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline.instant()) => {
                    tracing::warn!(
                        "Forecast for {} hit the request deadline after {:?}",
                        request,
                        started_at.elapsed()
                    );
                    break Err(ForecastError::Timeout(TimeoutStage::Request));
                }
                joined = legs.join_next() => {
                    let Some(joined) = joined else {
                        break Err(last_failure(std::mem::take(&mut failures)));
                    };
                    let (index, outcome) = match joined {
                        Ok(leg) => leg,
                        Err(e) => {
                            tracing::error!("Hedge leg task failed: {}", e);
                            // Unknown leg; rank it after every real provider.
                            (
                                providers.len(),
                                ProviderOutcome::Failure(ForecastError::upstream(
                                    "hedge",
                                    format!("provider task failed: {}", e),
                                )),
                            )
                        }
                    };
                    if index == 0 {
                        primary_running = false;
                    }

                    match outcome {
                        ProviderOutcome::Success(days) => {
                            tracing::info!(
                                "Forecast for {} served by {} in {:?}",
                                request,
                                providers[index].name(),
                                started_at.elapsed()
                            );
                            break Ok(days);
                        }
                        ProviderOutcome::Failure(err) if err.is_terminal() => {
                            tracing::info!("Forecast for {} failed terminally: {}", request, err);
                            break Err(err);
                        }
                        ProviderOutcome::Failure(err) => {
                            let name = providers.get(index).map_or("unknown", |p| p.name());
                            tracing::warn!("Provider {} failed for {}: {}", name, request, err);
                            failures.push((index, err));

                            if next < providers.len() {
                                tracing::debug!("Falling back to {}", providers[next].name());
                                spawn_leg(&mut legs, &providers[next], next, request, &scope);
                                next += 1;
                            } else if legs.is_empty() {
                                break Err(last_failure(std::mem::take(&mut failures)));
                            }
                        }
                    }
                }
                _ = &mut hedge_timer, if primary_running && next < providers.len() => {
                    tracing::info!(
                        "Primary {} exceeded {:?} for {}, hedging with {}",
                        providers[0].name(),
                        self.primary_max_duration,
                        request,
                        providers[next].name()
                    );
                    spawn_leg(&mut legs, &providers[next], next, request, &scope);
                    next += 1;
                    primary_running = false;
                }
            }
        };

        // Losers see the cancelled scope first, then their tasks are aborted
        // and reaped so nothing outlives this call.
        scope.cancel();
        if !legs.is_empty() {
            tracing::debug!("Stopping {} losing leg(s) for {}", legs.len(), request);
            legs.shutdown().await;
        }
        result
    }
}

/// Provider order is the tie-break: the last provider in the chain wins.
fn last_failure(mut failures: Vec<(usize, ForecastError)>) -> ForecastError {
    failures.sort_by_key(|(index, _)| *index);
    match failures.pop() {
        Some((_, err)) => err,
        None => ForecastError::UpstreamUnavailable(Box::new(ForecastError::upstream(
            "chain",
            "no provider produced a result",
        ))),
    }
}

fn spawn_leg(
    legs: &mut JoinSet<(usize, ProviderOutcome)>,
    provider: &Arc<dyn ForecastProvider>,
    index: usize,
    request: &ForecastRequest,
    scope: &Deadline,
) {
    let provider = Arc::clone(provider);
    let request = request.clone();
    let leg_deadline = scope.child();
    tracing::debug!("Starting provider {} for {}", provider.name(), request);

    legs.spawn(async move {
        let outcome = provider.fetch(&request, &leg_deadline).await.into();
        (index, outcome)
    });
}
