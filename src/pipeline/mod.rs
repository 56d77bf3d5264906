//! Concurrent packet analysis pipeline
//!
//! Raw frames go into a bounded queue; a pool of workers decodes them, runs
//! protocol detection and emits per-packet [`LocalModel`]s over a second
//! bounded channel. A single aggregator task is the only writer of the
//! shared [`NetworkModel`], so merging needs no per-field synchronization.
//!
//! Backpressure is asymmetric: submission blocks when the packet queue is
//! full, but worker results are dropped (and counted) when the aggregator
//! falls behind. A dropped result loses one packet's increments, never the
//! asset itself.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::classify::classify;
use crate::config::EngineConfig;
use crate::detection::DetectionEngine;
use crate::fingerprint::{dhcp_hostname, DeviceFingerprinter};
use crate::model::{Asset, Flow, LocalModel, NetworkModel};
use crate::network::CapturedPacket;
use crate::{AnalysisError, Result};

/// One raw frame as handed in by a capture source
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl RawFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, timestamp: Utc::now() }
    }
}

/// Shared pipeline counters, updated lock-free by workers
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub processed: AtomicU64,
    pub errored: AtomicU64,
    pub dropped: AtomicU64,
    pub merged: AtomicU64,
}

/// Point-in-time copy of the pipeline counters, plus cache totals
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSummary {
    pub packets_processed: u64,
    pub packets_errored: u64,
    pub results_dropped: u64,
    pub models_merged: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// A running analysis pipeline
pub struct PacketPipeline {
    packet_tx: mpsc::Sender<RawFrame>,
    workers: Vec<JoinHandle<()>>,
    aggregator: JoinHandle<()>,
    ticker: Option<JoinHandle<()>>,
    model: Arc<Mutex<NetworkModel>>,
    engine: Arc<DetectionEngine>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    config: EngineConfig,
}

impl PacketPipeline {
    /// Spawn the worker pool, aggregator and progress ticker
    pub fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(DetectionEngine::with_default_analyzers(config.cache_capacity));
        let model = Arc::new(Mutex::new(NetworkModel::new()));
        let stats = Arc::new(PipelineStats::default());
        let cancel = CancellationToken::new();

        let (packet_tx, packet_rx) = mpsc::channel::<RawFrame>(config.packet_queue);
        let (result_tx, result_rx) = mpsc::channel::<LocalModel>(config.result_queue);

        // tokio mpsc is single-consumer; the pool shares the receiver
        // behind an async mutex, held only across one recv at a time.
        let packet_rx = Arc::new(Mutex::new(packet_rx));

        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let rx = Arc::clone(&packet_rx);
            let tx = result_tx.clone();
            let engine = Arc::clone(&engine);
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, tx, engine, stats, cancel).await;
            }));
        }
        // The aggregator must see the channel close once all workers exit
        drop(result_tx);

        let aggregator = {
            let model = Arc::clone(&model);
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                aggregator_loop(result_rx, model, stats).await;
            })
        };

        let ticker = if config.report_interval_secs > 0 {
            let stats = Arc::clone(&stats);
            let engine = Arc::clone(&engine);
            let model = Arc::clone(&model);
            let cancel = cancel.clone();
            let interval = Duration::from_secs(config.report_interval_secs);
            Some(tokio::spawn(async move {
                ticker_loop(interval, stats, engine, model, cancel).await;
            }))
        } else {
            None
        };

        log::info!(
            "pipeline started: {} workers, packet queue {}, result queue {}",
            config.workers,
            config.packet_queue,
            config.result_queue
        );

        Ok(Self {
            packet_tx,
            workers,
            aggregator,
            ticker,
            model,
            engine,
            stats,
            cancel,
            config,
        })
    }

    /// Submit one raw frame. Blocks when the packet queue is full.
    pub async fn submit(&self, frame: RawFrame) -> Result<()> {
        self.packet_tx
            .send(frame)
            .await
            .map_err(|_| AnalysisError::PipelineError("packet queue closed".to_string()))
    }

    /// A cloneable submission handle for capture threads
    /// (`Sender::blocking_send` from outside the runtime)
    pub fn sender(&self) -> mpsc::Sender<RawFrame> {
        self.packet_tx.clone()
    }

    /// Request early shutdown: workers stop at the next dequeue
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Close submission, wait for every in-flight packet, then run the
    /// finalize pass (identity merge, fingerprinting, overrides,
    /// classification) and return the finished model.
    pub async fn drain(self) -> Result<(NetworkModel, PipelineSummary)> {
        let Self {
            packet_tx,
            workers,
            aggregator,
            ticker,
            model,
            engine,
            stats,
            cancel,
            config,
        } = self;

        drop(packet_tx);
        join_all(workers).await;
        aggregator
            .await
            .map_err(|e| AnalysisError::PipelineError(format!("aggregator task failed: {}", e)))?;
        cancel.cancel();
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }

        let mut finished = {
            let mut guard = model.lock().await;
            std::mem::take(&mut *guard)
        };
        finalize_model(&mut finished, &config);

        let cache = engine.cache();
        let summary = PipelineSummary {
            packets_processed: stats.processed.load(Ordering::Relaxed),
            packets_errored: stats.errored.load(Ordering::Relaxed),
            results_dropped: stats.dropped.load(Ordering::Relaxed),
            models_merged: stats.merged.load(Ordering::Relaxed),
            cache_hits: cache.hits(),
            cache_misses: cache.misses(),
        };
        log::info!(
            "pipeline drained: {} processed, {} errored, {} results dropped, {} assets, {} flows",
            summary.packets_processed,
            summary.packets_errored,
            summary.results_dropped,
            finished.asset_count(),
            finished.flow_count()
        );
        Ok((finished, summary))
    }
}

async fn worker_loop(
    worker_id: usize,
    packet_rx: Arc<Mutex<mpsc::Receiver<RawFrame>>>,
    result_tx: mpsc::Sender<LocalModel>,
    engine: Arc<DetectionEngine>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    loop {
        let frame = {
            let mut rx = packet_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                frame = rx.recv() => frame,
            }
        };
        let Some(frame) = frame else {
            break;
        };

        let packet = match CapturedPacket::decode(&frame.bytes, frame.timestamp) {
            Ok(packet) => packet,
            Err(e) => {
                stats.errored.fetch_add(1, Ordering::Relaxed);
                log::debug!("worker {}: undecodable frame: {}", worker_id, e);
                continue;
            }
        };

        let local = build_local_model(&packet, &engine);
        stats.processed.fetch_add(1, Ordering::Relaxed);

        match result_tx.try_send(local) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("worker {}: result queue full, dropping partial model", worker_id);
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    log::debug!("worker {} exiting", worker_id);
}

async fn aggregator_loop(
    mut result_rx: mpsc::Receiver<LocalModel>,
    model: Arc<Mutex<NetworkModel>>,
    stats: Arc<PipelineStats>,
) {
    while let Some(local) = result_rx.recv().await {
        let mut guard = model.lock().await;
        guard.merge_local(local);
        stats.merged.fetch_add(1, Ordering::Relaxed);
    }
    log::debug!("aggregator exiting, result channel closed");
}

async fn ticker_loop(
    interval: Duration,
    stats: Arc<PipelineStats>,
    engine: Arc<DetectionEngine>,
    model: Arc<Mutex<NetworkModel>>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await; // first tick completes immediately
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let (assets, flows) = {
                    let guard = model.lock().await;
                    (guard.asset_count(), guard.flow_count())
                };
                let cache = engine.cache();
                log::info!(
                    "progress: {} packets, {} dropped, {} assets, {} flows, cache {}/{} hit/miss",
                    stats.processed.load(Ordering::Relaxed),
                    stats.dropped.load(Ordering::Relaxed),
                    assets,
                    flows,
                    cache.hits(),
                    cache.misses()
                );
            }
        }
    }
}

/// Turn one decoded packet into the partial model covering its endpoints.
///
/// The sender records initiated traffic and carries the fingerprint
/// evidence; the receiver records received traffic. Protocol falls back to
/// the transport label when no analyzer matched.
pub fn build_local_model(packet: &CapturedPacket, engine: &DetectionEngine) -> LocalModel {
    let protocol = match engine.analyze_packet(packet) {
        Some(result) => result.protocol,
        None => packet.transport_label().to_string(),
    };

    let mut local = LocalModel::default();
    let (Some(src), Some(dst)) = (packet.src_id(), packet.dst_id()) else {
        return local;
    };

    let mut source = Asset::new(src);
    if source.mac.is_none() {
        source.mac = packet.src_mac.map(|m| m.to_string());
    }
    source.record_initiated(&protocol, dst);
    if let Some(port) = packet.src_port() {
        source.observe_port(port);
    }
    if packet.is_multicast_destination() {
        source.multicast_peer = true;
    }
    source.push_evidence(DeviceFingerprinter::extract_sample(packet));

    let mut destination = Asset::new(dst);
    if destination.mac.is_none() {
        destination.mac = packet.dst_mac.map(|m| m.to_string());
    }
    destination.record_received(&protocol, src);
    if let Some(port) = packet.dst_port() {
        destination.observe_port(port);
    }

    local.assets.push(source);
    local.assets.push(destination);
    local.flow = Some(Flow::new(src, dst, protocol, packet.wire_len as u64, packet.timestamp));
    local
}

/// The drain-time finalize pass, in fixed order: collapse duplicate
/// identities, fuse fingerprint evidence, apply manual overrides, classify.
fn finalize_model(model: &mut NetworkModel, config: &EngineConfig) {
    model.merge_by_mac();

    let fingerprinter = DeviceFingerprinter::new();
    for asset in model.assets.values_mut() {
        let samples = std::mem::take(&mut asset.evidence);

        if asset.hostname.is_empty() {
            if let Some(hostname) = dhcp_hostname(&samples) {
                asset.hostname = hostname;
            }
        }

        let info = fingerprinter.fingerprint_device(asset, &samples);
        if asset.vendor.is_empty() && !info.manufacturer.is_empty() {
            asset.vendor = info.manufacturer.clone();
        }
        if asset.device_name.is_empty() && !info.device_type.is_empty() {
            asset.device_name = info.device_type.clone();
        }
        if info.confidence > 0.0 {
            asset.device_info = Some(info);
        }

        if let Some(ip) = asset.ip {
            if let Some(rule) = config.override_for(ip) {
                asset.override_level = Some(rule.level);
                if asset.override_role.is_none() {
                    asset.override_role = rule.role.clone();
                }
            }
        }

        let classification = classify(asset);
        asset.inferred_level = classification.level;
        for role in &classification.roles {
            asset.push_role(role);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::protocol_names as proto;
    use crate::model::{AssetId, PurdueLevel};
    use crate::network::testing;
    use pnet::packet::tcp::TcpFlags;

    fn modbus_frame(query: bool) -> RawFrame {
        // MBAP header: txn 1, proto 0, length 6, unit 1, fc 3 read request
        let payload: &[u8] = &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0a];
        let (src_ip, dst_ip, src_port, dst_port) = if query {
            ("10.0.0.20", "10.0.0.10", 49152, 502)
        } else {
            ("10.0.0.10", "10.0.0.20", 502, 49152)
        };
        let frame = testing::tcp_frame(
            "00:11:22:33:44:55".parse().unwrap(),
            "00:1d:9c:01:02:03".parse().unwrap(),
            src_ip.parse().unwrap(),
            dst_ip.parse().unwrap(),
            src_port,
            dst_port,
            TcpFlags::PSH | TcpFlags::ACK,
            64,
            8192,
            payload,
        );
        RawFrame { bytes: frame, timestamp: Utc::now() }
    }

    fn test_config(workers: usize) -> EngineConfig {
        EngineConfig::default()
            .with_workers(workers)
            .with_packet_queue(64)
            .with_result_queue(1024)
            .with_cache_capacity(64)
    }

    #[tokio::test]
    async fn test_pipeline_builds_model_from_frames() {
        let pipeline = PacketPipeline::start(test_config(2)).unwrap();
        for _ in 0..10 {
            pipeline.submit(modbus_frame(true)).await.unwrap();
        }
        let (model, summary) = pipeline.drain().await.unwrap();

        assert_eq!(summary.packets_processed, 10);
        assert_eq!(summary.packets_errored, 0);
        assert_eq!(model.asset_count(), 2);

        let server = model
            .assets
            .get(&AssetId::Ip("10.0.0.10".parse().unwrap()))
            .unwrap();
        assert!(server.protocols.contains(proto::MODBUS));
        assert_eq!(server.received_counts[proto::MODBUS], 10);
        assert_eq!(server.inferred_level, PurdueLevel::L1);
        assert!(server.roles.iter().any(|r| r == "Modbus PLC"));
    }

    #[tokio::test]
    async fn test_flow_endpoints_exist_after_drain() {
        let pipeline = PacketPipeline::start(test_config(3)).unwrap();
        for i in 0..20 {
            pipeline.submit(modbus_frame(i % 2 == 0)).await.unwrap();
        }
        let (model, _) = pipeline.drain().await.unwrap();

        for key in model.flows.keys() {
            assert!(model.assets.contains_key(&key.source));
            assert!(model.assets.contains_key(&key.destination));
        }
    }

    #[tokio::test]
    async fn test_worker_count_does_not_change_totals() {
        let mut totals = Vec::new();
        for workers in [1usize, 4] {
            let pipeline = PacketPipeline::start(test_config(workers)).unwrap();
            for _ in 0..30 {
                pipeline.submit(modbus_frame(true)).await.unwrap();
            }
            let (model, summary) = pipeline.drain().await.unwrap();
            assert_eq!(summary.results_dropped, 0);
            let server = model
                .assets
                .get(&AssetId::Ip("10.0.0.10".parse().unwrap()))
                .unwrap();
            totals.push((model.asset_count(), server.received_counts[proto::MODBUS]));
        }
        assert_eq!(totals[0], totals[1]);
    }

    #[tokio::test]
    async fn test_undecodable_frame_counts_errored() {
        let pipeline = PacketPipeline::start(test_config(1)).unwrap();
        pipeline
            .submit(RawFrame { bytes: vec![0x00, 0x01, 0x02], timestamp: Utc::now() })
            .await
            .unwrap();
        pipeline.submit(modbus_frame(true)).await.unwrap();
        let (_, summary) = pipeline.drain().await.unwrap();
        assert_eq!(summary.packets_errored, 1);
        assert_eq!(summary.packets_processed, 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_accepting_work() {
        let pipeline = PacketPipeline::start(test_config(2)).unwrap();
        pipeline.submit(modbus_frame(true)).await.unwrap();
        pipeline.cancel();
        // Workers exit at dequeue; drain still returns whatever merged.
        let (_, summary) = pipeline.drain().await.unwrap();
        assert!(summary.packets_processed <= 1);
    }

    #[test]
    fn test_build_local_model_directionality() {
        let engine = DetectionEngine::with_default_analyzers(64);
        let frame = modbus_frame(true);
        let packet = CapturedPacket::decode(&frame.bytes, frame.timestamp).unwrap();
        let local = build_local_model(&packet, &engine);

        assert_eq!(local.assets.len(), 2);
        let source = &local.assets[0];
        let destination = &local.assets[1];
        assert_eq!(source.initiated_counts[proto::MODBUS], 1);
        assert_eq!(destination.received_counts[proto::MODBUS], 1);
        assert!(source.ports_seen.contains(&49152));
        assert!(destination.ports_seen.contains(&502));
        assert_eq!(source.evidence.len(), 1);

        let flow = local.flow.as_ref().unwrap();
        assert_eq!(flow.protocol, proto::MODBUS);
        assert_eq!(flow.packets, 1);
    }
}
