//! EntropyMonitor - stagnation advisory over a sliding window of state fingerprints
//!
//! Each sample hashes the observed state (tool output), a context tag and the
//! mission id. When the most recent samples keep repeating, the environment is
//! not changing despite the agent acting. The monitor only reports; escalating a
//! stagnant signal is left to whoever plans the next step, since some repetition
//! (polling) is legitimate.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::EntropyConfig;

/// Advisory level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntropyStatus {
    /// Fewer than two samples
    Initializing,
    /// State is changing
    Normal,
    /// At least half the window repeats
    Stable,
    /// The repetition ratio reached the stagnation threshold
    Stagnant,
}

impl fmt::Display for EntropyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Normal => write!(f, "normal"),
            Self::Stable => write!(f, "stable"),
            Self::Stagnant => write!(f, "stagnant"),
        }
    }
}

/// One captured state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntropySample {
    /// sha256 of `fingerprint|tag|mission`
    pub hash: String,
    pub context_tag: String,
    pub mission_id: Option<String>,

    /// Capture ordinal since creation or last reset
    pub position: u64,
}

/// Result of [`EntropyMonitor::analyze`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntropyAnalysis {
    pub status: EntropyStatus,

    /// Consecutive identical samples counted back from the newest
    pub repetition_count: usize,
    pub window_size: usize,
}

impl EntropyAnalysis {
    /// One-line summary, e.g. `State Entropy: STAGNANT (Repetitions: 6/6)`
    pub fn report(&self) -> String {
        format!(
            "State Entropy: {} (Repetitions: {}/{})",
            self.status.to_string().to_uppercase(),
            self.repetition_count,
            self.window_size
        )
    }
}

/// Sliding-window stagnation detector
#[derive(Debug, Clone)]
pub struct EntropyMonitor {
    window: VecDeque<EntropySample>,
    window_size: usize,
    stagnant_threshold: f64,
    stable_threshold: f64,
    captured: u64,
}

impl EntropyMonitor {
    /// Monitor with the default thresholds
    pub fn new(window_size: usize) -> Self {
        Self::from_config(&EntropyConfig {
            window_size,
            ..Default::default()
        })
    }

    pub fn from_config(config: &EntropyConfig) -> Self {
        debug!(window_size = config.window_size, "EntropyMonitor::from_config: called");
        let window_size = config.window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            stagnant_threshold: config.stagnant_threshold,
            stable_threshold: config.stable_threshold,
            captured: 0,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Samples currently in the window, oldest first
    pub fn samples(&self) -> impl Iterator<Item = &EntropySample> {
        self.window.iter()
    }

    /// Record the current state
    pub fn capture(&mut self, state_fingerprint: &str, context_tag: &str, mission_id: Option<&str>) {
        let material = format!(
            "TO:{}|CTX:{}|MID:{}",
            state_fingerprint.trim(),
            context_tag.trim(),
            mission_id.unwrap_or("").trim()
        );
        let hash = hex::encode(Sha256::digest(material.as_bytes()));
        debug!(hash = &hash[..8], window = self.window.len(), "EntropyMonitor::capture: called");

        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(EntropySample {
            hash,
            context_tag: context_tag.to_string(),
            mission_id: mission_id.map(str::to_string),
            position: self.captured,
        });
        self.captured += 1;
    }

    /// Current advisory
    pub fn analyze(&self) -> EntropyAnalysis {
        if self.window.len() < 2 && self.window_size > 1 {
            return EntropyAnalysis {
                status: EntropyStatus::Initializing,
                repetition_count: 0,
                window_size: self.window_size,
            };
        }

        let repetition_count = match self.window.back() {
            Some(last) => self.window.iter().rev().take_while(|s| s.hash == last.hash).count(),
            None => 0,
        };
        let ratio = repetition_count as f64 / self.window_size as f64;
        let status = if ratio >= self.stagnant_threshold {
            EntropyStatus::Stagnant
        } else if ratio >= self.stable_threshold && repetition_count > 1 {
            EntropyStatus::Stable
        } else {
            EntropyStatus::Normal
        };
        debug!(%status, repetition_count, "EntropyMonitor::analyze: result");

        EntropyAnalysis {
            status,
            repetition_count,
            window_size: self.window_size,
        }
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        debug!("EntropyMonitor::reset: called");
        self.window.clear();
        self.captured = 0;
    }
}

impl Default for EntropyMonitor {
    fn default() -> Self {
        Self::from_config(&EntropyConfig::default())
    }
}
