//! ipmasd - presence monitoring daemon
//!
//! This daemon:
//! 1. Loads the known roster from the known-faces directory
//! 2. Captures frames and offers every `frame_skip`-th one to the recognition worker
//! 3. Lets the worker resolve identities and write entry/exit sessions to SQLite
//! 4. Reloads the roster when registrations change
//! 5. Shuts down cleanly on Ctrl-C or when the source runs dry

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipmas::config::IpmasConfig;
use ipmas::roster::RosterWatcher;
use ipmas::{
    admit_frame, open_source, spawn_worker, Admission, DirectoryRosterProvider, EmbedderRegistry,
    FrameSlot, IdentityResolver, ResultsBoard, RosterHandle, RosterProvider, SqliteSessionStore,
    Supervisor, UnknownPool, UnknownSnapshotWriter,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = IpmasConfig::load()?;
    log::info!("ipmasd {} starting", env!("CARGO_PKG_VERSION"));

    let registry = build_registry(&cfg)?;
    log::info!(
        "embedder={} (available: {}), metric={}",
        cfg.recognition.embedder,
        registry.list().join(", "),
        cfg.recognition.metric.as_str()
    );

    let mut roster_provider = DirectoryRosterProvider::new(registry.create_default()?);
    let roster = RosterHandle::new(roster_provider.load_roster(&cfg.known_faces_dir)?);
    let mut roster_watcher = RosterWatcher::new(&cfg.known_faces_dir);

    if let Some(parent) = cfg.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut store = SqliteSessionStore::open(&cfg.db_path)?;
    if cfg.reset_database {
        log::warn!("resetting session table in {}", cfg.db_path.display());
        store.reset()?;
    }

    let resolver = IdentityResolver::new(cfg.recognition.metric, cfg.thresholds()).with_pool(
        UnknownPool::with_capacity_limit(cfg.recognition.unknown_pool_capacity),
    );
    let mut supervisor = Supervisor::new(
        registry.create_default()?,
        roster.clone(),
        resolver,
        Box::new(store),
        cfg.supervisor_settings(),
    );
    if cfg.alert_unknown {
        supervisor = supervisor.with_snapshots(UnknownSnapshotWriter::new(&cfg.intruders_dir));
    }

    let slot = Arc::new(FrameSlot::new());
    let board = Arc::new(ResultsBoard::new());
    let worker = spawn_worker(supervisor, Arc::clone(&slot), Arc::clone(&board))?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst))
        .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    let mut source = open_source(&cfg.source_config())?;
    source.connect()?;

    log::info!(
        "ipmasd running. source={} db={} frame_skip={} scale={} exit_timeout={:.1}s",
        cfg.source.url,
        cfg.db_path.display(),
        cfg.recognition.frame_skip,
        cfg.recognition.frame_resize_scale,
        cfg.exit_timeout.as_secs_f64()
    );

    let frame_interval = Duration::from_secs_f64(1.0 / f64::from(cfg.source.target_fps));
    let mut frame_count = 0u64;
    let mut dropped = 0u64;
    let mut last_health_log = Instant::now();
    let mut last_roster_poll = Instant::now();
    let mut last_reported_cycle = 0u64;
    let mut frames_since_log = 0u64;

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("video source exhausted after {} frames", frame_count);
                break;
            }
            Err(e) => {
                log::error!("frame capture failed: {}", e);
                break;
            }
        };
        frame_count += 1;
        frames_since_log += 1;

        match admit_frame(&slot, frame_count, cfg.recognition.frame_skip, frame)? {
            None | Some(Admission::Accepted) => {}
            Some(Admission::Dropped) => {
                dropped += 1;
                log::debug!("recognition busy, dropped frame {}", frame_count);
            }
            Some(Admission::Closed) => {
                log::error!("recognition worker stopped unexpectedly");
                break;
            }
        }

        if last_roster_poll.elapsed() >= cfg.roster_poll_interval {
            last_roster_poll = Instant::now();
            if roster_watcher.changed() {
                match roster_provider.load_roster(&cfg.known_faces_dir) {
                    Ok(fresh) => {
                        let count = fresh.len();
                        roster.swap(fresh)?;
                        log::info!("roster reloaded ({} reference vectors)", count);
                    }
                    Err(e) => log::warn!("roster reload failed, keeping previous: {}", e),
                }
            }
        }

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            let elapsed = last_health_log.elapsed().as_secs_f64();
            let snapshot = board.latest();
            let stats = source.stats();
            log::info!(
                "source health={} frames={} fps={:.1} dropped={} cycles={} latency={}ms",
                source.is_healthy(),
                stats.frames_captured,
                frames_since_log as f64 / elapsed,
                dropped,
                snapshot.sequence,
                snapshot.latency.as_millis()
            );
            if snapshot.sequence != last_reported_cycle {
                last_reported_cycle = snapshot.sequence;
                let names: Vec<&str> = snapshot
                    .detections
                    .iter()
                    .map(|d| d.identity.as_str())
                    .collect();
                log::info!("in view: [{}]", names.join(", "));
            }
            last_health_log = Instant::now();
            frames_since_log = 0;
        }

        if let Some(rest) = frame_interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    if !running.load(Ordering::SeqCst) {
        log::info!("interrupt received, shutting down");
    }
    let stats = worker.stop()?;
    log::info!(
        "ipmasd stopped: {} frames captured, {} recognition cycles, {} dropped",
        frame_count,
        stats.cycles,
        dropped
    );
    Ok(())
}

fn build_registry(cfg: &IpmasConfig) -> Result<EmbedderRegistry> {
    let mut registry = EmbedderRegistry::with_builtin();
    register_model_backend(&mut registry, cfg);
    registry.set_default(&cfg.recognition.embedder)?;
    Ok(registry)
}

#[cfg(feature = "backend-tract")]
fn register_model_backend(registry: &mut EmbedderRegistry, cfg: &IpmasConfig) {
    let Some(model_path) = cfg.recognition.model_path.clone() else {
        return;
    };
    let side = cfg.recognition.model_input_side;
    registry.register("tract", move || {
        Ok(Box::new(ipmas::embed::TractEmbedder::new(&model_path, side)?))
    });
}

#[cfg(not(feature = "backend-tract"))]
fn register_model_backend(_registry: &mut EmbedderRegistry, cfg: &IpmasConfig) {
    if cfg.recognition.model_path.is_some() {
        log::warn!("model_path is set but this build has no tract backend");
    }
}
