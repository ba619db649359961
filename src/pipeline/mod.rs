pub mod transform;

pub use transform::TransformedPage;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::{EngineRegistry, EngineRequest, Feature};
use crate::error::{EngineAttempt, PrefetchArtifact, ScrapeError};
use crate::models::{InternalOptions, ScrapeOptions};

/// Default overall deadline when the request does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Executes a single scrape request against the engine fallback list.
///
/// The walk runs under one deadline: every engine gets the time that is left,
/// not a fresh budget. `AddFeatures`/`RemoveFeatures` restart the walk with
/// an adjusted feature set and the same deadline; other engine errors advance
/// to the next engine and are recorded in the attempt tracker.
#[derive(Clone)]
pub struct ScrapePipeline {
    registry: Arc<EngineRegistry>,
}

impl ScrapePipeline {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        ScrapePipeline { registry }
    }

    pub async fn run(
        &self,
        url: &str,
        options: &ScrapeOptions,
        internal: &InternalOptions,
    ) -> Result<TransformedPage, ScrapeError> {
        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);
        let deadline = Instant::now() + timeout;

        let mut required = Feature::required_for(options);
        let mut prefetch: Option<PrefetchArtifact> = None;
        let mut tracker: Vec<EngineAttempt> = Vec::new();
        let mut exhausted: HashSet<&'static str> = HashSet::new();

        'restart: loop {
            let plan: Vec<_> = self
                .registry
                .plan(required, internal.force_engine.as_deref())
                .into_iter()
                .filter(|planned| !exhausted.contains(planned.name()))
                .collect();

            if plan.is_empty() {
                return Err(ScrapeError::NoEnginesLeft { tracker });
            }

            for planned in plan {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracker.push(EngineAttempt {
                        engine: planned.name().to_string(),
                        error: "deadline exhausted before attempt".to_string(),
                    });
                    return Err(ScrapeError::NoEnginesLeft { tracker });
                }

                if !planned.unsupported.is_empty() {
                    tracing::debug!(
                        engine = planned.name(),
                        unsupported = ?planned.unsupported,
                        "Engine cannot provide every required feature, degrading"
                    );
                }

                let request = EngineRequest {
                    url: url.to_string(),
                    options: options.clone(),
                    features: required,
                    time_budget: remaining,
                    zero_data_retention: internal.zero_data_retention,
                    prefetch: prefetch.take(),
                };

                // The request owns the prefetch artifact from here; engines
                // that ignore it drop it with the request, deleting the file.
                let attempt = tokio::time::timeout(remaining, planned.engine.scrape(&request)).await;

                match attempt {
                    Err(_elapsed) => {
                        tracker.push(EngineAttempt {
                            engine: planned.name().to_string(),
                            error: ScrapeError::Timeout {
                                budget_ms: remaining.as_millis() as u64,
                            }
                            .to_string(),
                        });
                        exhausted.insert(planned.name());
                    }
                    Ok(Ok(response)) => {
                        return Ok(transform::transform(url, response, options));
                    }
                    Ok(Err(ScrapeError::AddFeatures { flags, pdf_prefetch })) => {
                        tracker.push(EngineAttempt {
                            engine: planned.name().to_string(),
                            error: format!("requested features {flags:?}"),
                        });
                        required |= flags;
                        if pdf_prefetch.is_some() {
                            prefetch = pdf_prefetch;
                        }
                        exhausted.insert(planned.name());
                        continue 'restart;
                    }
                    Ok(Err(ScrapeError::RemoveFeatures { flags })) => {
                        tracker.push(EngineAttempt {
                            engine: planned.name().to_string(),
                            error: format!("dropped features {flags:?}"),
                        });
                        required -= flags;
                        exhausted.insert(planned.name());
                        continue 'restart;
                    }
                    Ok(Err(error)) if error.advances_fallback() => {
                        tracing::debug!(
                            engine = planned.name(),
                            error = %error,
                            "Engine failed, advancing fallback"
                        );
                        tracker.push(EngineAttempt {
                            engine: planned.name().to_string(),
                            error: error.to_string(),
                        });
                        exhausted.insert(planned.name());
                    }
                    Ok(Err(error)) => return Err(error),
                }
            }

            return Err(ScrapeError::NoEnginesLeft { tracker });
        }
    }
}
