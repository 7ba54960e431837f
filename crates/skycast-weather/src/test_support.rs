//! Scripted providers and fixtures shared by unit tests.

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::deadline::Deadline;
use crate::error::{ForecastError, TimeoutStage};
use crate::provider::ForecastProvider;
use crate::types::{ForecastDay, ForecastRequest};

pub fn forecast(days: u8, max_temp: f64) -> Vec<ForecastDay> {
    let start = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap_or_default();
    (0..days)
        .map(|i| ForecastDay {
            date: start + Days::new(u64::from(i)),
            min_temp_c: max_temp - 8.0,
            max_temp_c: max_temp,
            avg_temp_c: max_temp - 4.0,
            condition_text: "Partly cloudy".to_string(),
        })
        .collect()
}

pub fn request(city: &str, days: u8) -> ForecastRequest {
    match "CZ".parse() {
        Ok(cc) => match ForecastRequest::new(city, cc, days) {
            Ok(r) => r,
            Err(e) => unreachable!("bad fixture request: {}", e),
        },
        Err(e) => unreachable!("bad fixture country: {}", e),
    }
}

/// One scripted reply: wait `delay`, then return `result`.
#[derive(Clone)]
pub struct Step {
    pub delay: Duration,
    pub result: Result<Vec<ForecastDay>, ForecastError>,
}

impl Step {
    pub fn ok(delay_ms: u64, days: Vec<ForecastDay>) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            result: Ok(days),
        }
    }

    pub fn err(delay_ms: u64, err: ForecastError) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            result: Err(err),
        }
    }
}

/// Bumps `counter` when dropped before `finished` is set.
struct Unfinished<'a> {
    counter: &'a AtomicUsize,
    finished: bool,
}

impl Drop for Unfinished<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Provider replaying scripted steps; the last step repeats forever.
pub struct ScriptedProvider {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    abandoned: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fetches that stopped before their step finished, by cancellation or by being dropped.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Option<Step> {
        let mut steps = self.steps.lock();
        if steps.len() > 1 {
            steps.pop_front()
        } else {
            steps.front().cloned()
        }
    }
}

#[async_trait]
impl ForecastProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        _request: &ForecastRequest,
        deadline: &Deadline,
    ) -> Result<Vec<ForecastDay>, ForecastError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(step) = self.next_step() else {
            return Err(ForecastError::upstream(&self.name, "no scripted step"));
        };

        let mut unfinished = Unfinished {
            counter: &self.abandoned,
            finished: false,
        };
        let result = deadline
            .guard(
                async {
                    tokio::time::sleep(step.delay).await;
                    step.result.clone()
                },
                ForecastError::Timeout(TimeoutStage::Provider),
                ForecastError::Cancelled,
            )
            .await;

        unfinished.finished = !matches!(result, Err(ForecastError::Cancelled));
        result
    }
}
