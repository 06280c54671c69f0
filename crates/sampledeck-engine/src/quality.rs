//! Adaptive quality controller.
//!
//! Maps [`PerformanceSignal`]s to a [`QualityLevel`]. Each level fixes the
//! resolution cap, pool size, cache size and antialiasing flag used for
//! subsequent requests. There is no hysteresis: every signal may move the
//! level.

use crate::monitor::PerformanceSignal;
use sampledeck_core::{DownsampleMethod, QualityConfig, QualityLevel};
use serde::Serialize;
use tracing::info;

/// Resource settings for one quality level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualitySettings {
    /// Upper bound on requested output samples.
    pub max_target_samples: usize,
    pub max_workers: usize,
    pub cache_entries: usize,
    pub antialiasing: bool,
}

impl QualitySettings {
    pub fn for_level(level: QualityLevel) -> Self {
        match level {
            QualityLevel::High => Self {
                max_target_samples: 8192,
                max_workers: 4,
                cache_entries: 100,
                antialiasing: true,
            },
            QualityLevel::Medium => Self {
                max_target_samples: 4096,
                max_workers: 3,
                cache_entries: 50,
                antialiasing: true,
            },
            QualityLevel::Low => Self {
                max_target_samples: 2048,
                max_workers: 2,
                cache_entries: 25,
                antialiasing: false,
            },
            QualityLevel::Minimal => Self {
                max_target_samples: 1024,
                max_workers: 1,
                cache_entries: 10,
                antialiasing: false,
            },
        }
    }
}

/// A level change produced by [`QualityController::on_signal`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityTransition {
    pub from: QualityLevel,
    pub to: QualityLevel,
    pub settings: QualitySettings,
    /// True when the triggering signal was critical.
    pub critical: bool,
}

/// Steps through quality levels in response to performance signals.
#[derive(Debug, Clone)]
pub struct QualityController {
    level: QualityLevel,
    adaptive: bool,
}

impl QualityController {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            level: config.initial_level,
            adaptive: config.adaptive,
        }
    }

    pub fn level(&self) -> QualityLevel {
        self.level
    }

    pub fn settings(&self) -> QualitySettings {
        QualitySettings::for_level(self.level)
    }

    pub fn method(&self) -> DownsampleMethod {
        self.level.method()
    }

    /// Clamp a requested output length to the current level's cap.
    pub fn clamp_target(&self, requested: usize) -> usize {
        requested.min(self.settings().max_target_samples)
    }

    /// Force a level regardless of the adaptive flag.
    pub fn set_level(&mut self, level: QualityLevel) -> Option<QualityTransition> {
        self.transition(level, false)
    }

    /// React to a signal. Critical drops two levels, degraded drops one,
    /// healthy climbs one. Returns the change, if any.
    pub fn on_signal(&mut self, signal: &PerformanceSignal) -> Option<QualityTransition> {
        if !self.adaptive {
            return None;
        }
        let (next, critical) = match signal {
            PerformanceSignal::Critical { .. } => (self.level.lower(2), true),
            PerformanceSignal::Degraded { .. } => (self.level.lower(1), false),
            PerformanceSignal::Healthy => (self.level.higher(), false),
        };
        self.transition(next, critical)
    }

    fn transition(&mut self, to: QualityLevel, critical: bool) -> Option<QualityTransition> {
        if to == self.level {
            return None;
        }
        let from = self.level;
        self.level = to;
        info!(from = from.name(), to = to.name(), critical, "quality level changed");
        Some(QualityTransition {
            from,
            to,
            settings: QualitySettings::for_level(to),
            critical,
        })
    }
}
