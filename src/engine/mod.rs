pub mod browser;
pub mod document;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{PrefetchArtifact, ScrapeError};
use crate::models::{Format, ProxyTier, ScrapeOptions};

bitflags! {
    /// Capabilities a scrape may require and an engine may provide.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Feature: u32 {
        const ACTIONS = 1 << 0;
        const WAIT_FOR = 1 << 1;
        const SCREENSHOT = 1 << 2;
        const FULL_PAGE_SCREENSHOT = 1 << 3;
        const PDF = 1 << 4;
        const DOCX = 1 << 5;
        const LOCATION = 1 << 6;
        const MOBILE = 1 << 7;
        const SKIP_TLS = 1 << 8;
        const FAST_MODE = 1 << 9;
        const STEALTH_PROXY = 1 << 10;
        const DISABLE_ADBLOCK = 1 << 11;
    }
}

/// Priority weight per feature. Heavier features dominate the planner's
/// support threshold, so an engine that cannot convert a PDF never survives
/// planning for one.
const FEATURE_WEIGHTS: &[(Feature, u32)] = &[
    (Feature::ACTIONS, 20),
    (Feature::WAIT_FOR, 20),
    (Feature::SCREENSHOT, 10),
    (Feature::FULL_PAGE_SCREENSHOT, 10),
    (Feature::PDF, 100),
    (Feature::DOCX, 100),
    (Feature::LOCATION, 10),
    (Feature::MOBILE, 10),
    (Feature::SKIP_TLS, 20),
    (Feature::FAST_MODE, 20),
    (Feature::STEALTH_PROXY, 50),
    (Feature::DISABLE_ADBLOCK, 10),
];

impl Feature {
    pub fn total_weight(self) -> u32 {
        FEATURE_WEIGHTS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, weight)| *weight)
            .sum()
    }

    /// Features a scrape request needs, derived from its options.
    pub fn required_for(options: &ScrapeOptions) -> Feature {
        let mut required = Feature::empty();
        if options.formats.contains(&Format::Screenshot) {
            required |= Feature::SCREENSHOT;
        }
        if options.formats.contains(&Format::ScreenshotFullPage) {
            required |= Feature::FULL_PAGE_SCREENSHOT;
        }
        if !options.actions.is_empty() {
            required |= Feature::ACTIONS;
        }
        if options.wait_for_ms > 0 {
            required |= Feature::WAIT_FOR;
        }
        if options.skip_tls_verification {
            required |= Feature::SKIP_TLS;
        }
        if options.fast_mode {
            required |= Feature::FAST_MODE;
        }
        if options.mobile {
            required |= Feature::MOBILE;
        }
        if options.location.is_some() {
            required |= Feature::LOCATION;
        }
        if options.proxy == ProxyTier::Stealth {
            required |= Feature::STEALTH_PROXY;
        }
        if !options.block_ads {
            required |= Feature::DISABLE_ADBLOCK;
        }
        required
    }
}

/// Static description of an engine: what it can do and how good its output
/// is. Higher quality wins ties; engines with quality <= 0 are last resorts.
#[derive(Debug, Clone)]
pub struct EngineDescriptor {
    pub name: &'static str,
    pub capabilities: Feature,
    pub quality: i32,
}

/// A single fetch attempt's input.
#[derive(Debug)]
pub struct EngineRequest {
    pub url: String,
    pub options: ScrapeOptions,
    pub features: Feature,
    pub time_budget: Duration,
    pub zero_data_retention: bool,
    /// Body already downloaded by a previous engine while sniffing content
    /// types, handed along so the document engine need not re-fetch.
    pub prefetch: Option<PrefetchArtifact>,
}

/// Raw output of an engine, before transformation into a Document.
#[derive(Debug, Clone, Default)]
pub struct EngineResponse {
    pub url: String,
    pub status_code: u16,
    pub html: Option<String>,
    pub content_type: Option<String>,
    pub screenshot: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait ScrapeEngine: Send + Sync {
    fn descriptor(&self) -> EngineDescriptor;
    async fn scrape(&self, request: &EngineRequest) -> Result<EngineResponse, ScrapeError>;
}

/// One entry of a fallback plan.
#[derive(Clone)]
pub struct PlannedEngine {
    pub engine: Arc<dyn ScrapeEngine>,
    pub support_score: u32,
    /// Required features this engine cannot provide, kept so the pipeline
    /// can log the degradation.
    pub unsupported: Feature,
}

impl PlannedEngine {
    pub fn name(&self) -> &'static str {
        self.engine.descriptor().name
    }
}

/// The set of engines available in this process, fixed at startup.
pub struct EngineRegistry {
    engines: Vec<Arc<dyn ScrapeEngine>>,
}

impl EngineRegistry {
    pub fn new(engines: Vec<Arc<dyn ScrapeEngine>>) -> Self {
        EngineRegistry { engines }
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Produce the ordered fallback list for a feature set.
    ///
    /// Engines must cover at least half the priority weight of the required
    /// features to qualify. If any qualifying engine has positive quality,
    /// the zero/negative-quality stragglers are dropped. `force_engine`
    /// bypasses planning entirely.
    pub fn plan(&self, required: Feature, force_engine: Option<&str>) -> Vec<PlannedEngine> {
        if let Some(forced) = force_engine {
            return self
                .engines
                .iter()
                .filter(|engine| engine.descriptor().name == forced)
                .map(|engine| {
                    let descriptor = engine.descriptor();
                    PlannedEngine {
                        support_score: (required & descriptor.capabilities).total_weight(),
                        unsupported: required - descriptor.capabilities,
                        engine: engine.clone(),
                    }
                })
                .collect();
        }

        let threshold = required.total_weight() / 2;
        let mut candidates: Vec<(PlannedEngine, i32)> = self
            .engines
            .iter()
            .filter_map(|engine| {
                let descriptor = engine.descriptor();
                let support_score = (required & descriptor.capabilities).total_weight();
                if support_score < threshold {
                    return None;
                }
                Some((
                    PlannedEngine {
                        support_score,
                        unsupported: required - descriptor.capabilities,
                        engine: engine.clone(),
                    },
                    descriptor.quality,
                ))
            })
            .collect();

        if candidates.iter().any(|(_, quality)| *quality > 0) {
            candidates.retain(|(_, quality)| *quality > 0);
        }

        candidates.sort_by(|a, b| {
            b.0.support_score
                .cmp(&a.0.support_score)
                .then_with(|| b.1.cmp(&a.1))
        });

        candidates.into_iter().map(|(planned, _)| planned).collect()
    }
}
