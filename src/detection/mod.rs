//! Protocol detection engine
//!
//! A registry of [`ProtocolAnalyzer`]s, each declaring whether it can
//! interpret a packet. The engine runs every applicable analyzer, keeps the
//! highest-confidence result (first found wins ties), records per-analyzer
//! statistics and caches winning results by payload fingerprint.
//!
//! The analyzer set can be swapped while analysis is in flight: iteration
//! happens over a cloned `Arc` snapshot, never under the registry lock.

pub mod analyzers;
pub mod cache;

pub use analyzers::default_analyzers;
pub use cache::{cache_key, DetectionCache};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use crate::network::CapturedPacket;

/// Well-known protocol names shared by the analyzers and the classifier
pub mod protocol_names {
    pub const MODBUS: &str = "Modbus";
    pub const S7: &str = "S7";
    pub const ENIP: &str = "EtherNet/IP";
    pub const CIP_IO: &str = "CIP-IO";
    pub const OPC_UA: &str = "OPC-UA";
    pub const DNP3: &str = "DNP3";
    pub const BACNET: &str = "BACnet";
    pub const FINS: &str = "FINS";
    pub const SLMP: &str = "SLMP";
    pub const IEC104: &str = "IEC-104";
    pub const DHCP: &str = "DHCP";
    pub const DNS: &str = "DNS";
    pub const HTTP: &str = "HTTP";
}

/// How a detection verdict was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionMethod {
    Port,
    Dpi,
    Heuristic,
    Signature,
}

/// One protocol identification verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub protocol: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub method: DetectionMethod,
    pub details: String,
}

impl DetectionResult {
    pub fn new(protocol: &str, confidence: f64, method: DetectionMethod, details: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            method,
            details: details.to_string(),
        }
    }
}

/// Capability interface for one protocol analyzer
pub trait ProtocolAnalyzer: Send + Sync {
    /// Registry name, also the stats key
    fn name(&self) -> &'static str;

    /// Cheap precondition, checked before [`Self::analyze`]
    fn can_analyze(&self, packet: &CapturedPacket) -> bool;

    /// Full analysis; `None` when the packet turns out not to match
    fn analyze(&self, packet: &CapturedPacket) -> Option<DetectionResult>;
}

/// Per-analyzer success/failure counters and running mean confidence
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalyzerStats {
    pub successes: u64,
    pub failures: u64,
    pub mean_confidence: f64,
}

impl AnalyzerStats {
    fn record_success(&mut self, confidence: f64) {
        self.successes += 1;
        self.mean_confidence += (confidence - self.mean_confidence) / self.successes as f64;
    }

    fn record_failure(&mut self) {
        self.failures += 1;
    }
}

/// The protocol detection engine
pub struct DetectionEngine {
    analyzers: RwLock<Arc<Vec<Arc<dyn ProtocolAnalyzer>>>>,
    stats: Mutex<HashMap<&'static str, AnalyzerStats>>,
    cache: DetectionCache,
}

impl DetectionEngine {
    /// Create an engine with no analyzers registered
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            analyzers: RwLock::new(Arc::new(Vec::new())),
            stats: Mutex::new(HashMap::new()),
            cache: DetectionCache::new(cache_capacity),
        }
    }

    /// Create an engine with the full default analyzer set
    pub fn with_default_analyzers(cache_capacity: usize) -> Self {
        let engine = Self::new(cache_capacity);
        engine.replace_analyzers(default_analyzers());
        engine
    }

    /// Add one analyzer to the registry
    pub fn register_analyzer(&self, analyzer: Arc<dyn ProtocolAnalyzer>) {
        let mut guard = self.analyzers.write().unwrap();
        let mut next = guard.as_ref().clone();
        next.push(analyzer);
        *guard = Arc::new(next);
    }

    /// Swap the full analyzer set. Safe while analysis is in flight:
    /// in-progress packets finish against the snapshot they started with.
    pub fn replace_analyzers(&self, analyzers: Vec<Arc<dyn ProtocolAnalyzer>>) {
        let mut guard = self.analyzers.write().unwrap();
        *guard = Arc::new(analyzers);
    }

    /// Registered analyzer names, in registry order
    pub fn analyzer_names(&self) -> Vec<&'static str> {
        self.analyzers
            .read()
            .unwrap()
            .iter()
            .map(|a| a.name())
            .collect()
    }

    /// Identify the application protocol of one packet.
    ///
    /// Checks the cache first; on a miss, runs every applicable analyzer and
    /// keeps the single highest-confidence result (ties keep the first
    /// found). Analyzer panics are caught and counted as failures.
    pub fn analyze_packet(&self, packet: &CapturedPacket) -> Option<DetectionResult> {
        let key = cache_key(packet);
        if let Some(hit) = self.cache.get(key) {
            return Some(hit);
        }

        let snapshot = self.analyzers.read().unwrap().clone();
        let mut best: Option<DetectionResult> = None;

        for analyzer in snapshot.iter() {
            if !analyzer.can_analyze(packet) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| analyzer.analyze(packet)));
            let mut stats = self.stats.lock().unwrap();
            let entry = stats.entry(analyzer.name()).or_default();
            match outcome {
                Ok(Some(result)) => {
                    entry.record_success(result.confidence);
                    let better = match &best {
                        Some(current) => result.confidence > current.confidence,
                        None => true,
                    };
                    if better {
                        best = Some(result);
                    }
                }
                Ok(None) => entry.record_failure(),
                Err(_) => {
                    entry.record_failure();
                    log::warn!("analyzer {} panicked, marked failed", analyzer.name());
                }
            }
        }

        if let Some(result) = &best {
            self.cache.insert(key, result.clone());
        }
        best
    }

    /// Snapshot of per-analyzer statistics
    pub fn stats_snapshot(&self) -> HashMap<&'static str, AnalyzerStats> {
        self.stats.lock().unwrap().clone()
    }

    pub fn cache(&self) -> &DetectionCache {
        &self.cache
    }
}
