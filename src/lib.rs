//! icsmap - industrial network topology mapper
//!
//! Turns captured traffic into a model of the plant network: which assets
//! exist, which industrial protocols they speak, who talks to whom, and
//! where each device sits in the Purdue reference model.

pub mod classify;
pub mod config;
pub mod detection;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod network;
pub mod pipeline;

// Re-export commonly used types
pub use classify::{classify, Classification};
pub use config::{EngineConfig, OverrideRule};
pub use detection::{DetectionEngine, DetectionResult, ProtocolAnalyzer};
pub use error::AnalysisError;
pub use fingerprint::{DeviceFingerprinter, DeviceInfo};
pub use model::{Asset, AssetId, Flow, NetworkModel, PurdueLevel};
pub use network::CapturedPacket;
pub use pipeline::{PacketPipeline, PipelineSummary, RawFrame};

pub type Result<T> = std::result::Result<T, AnalysisError>;
