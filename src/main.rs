// src/main.rs
use anyhow::{anyhow, Context, Result};
use neurowindow::drivers::{
    AnalysisLoop, LoopLimit, SyntheticMarkers, SyntheticSignal, TransformSpec,
};
use neurowindow::{SessionConfig, StreamSession, StreamInfo, Unit};
use std::sync::Arc;

const CHANNELS: usize = 8;
const RATE_HZ: f64 = 250.0;

fn load_config() -> Result<SessionConfig> {
    match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_json_file(&path)
            .with_context(|| format!("failed to load session config from {path}")),
        None => Ok(SessionConfig::default()),
    }
}

// Synthetic two-stream session: live windows first, then epochs.
fn main() -> Result<()> {
    env_logger::init();
    let config = load_config()?;

    let info = StreamInfo::new("synthetic-eeg", StreamInfo::default_labels(CHANNELS), RATE_HZ)
        .with_unit(Unit::Microvolts);
    let mut session = StreamSession::connect(
        info,
        &config,
        SyntheticSignal::new("synthetic-eeg", CHANNELS, RATE_HZ),
    )
    .context("signal stream did not come up")?;
    if let Err(err) = session.attach_markers(SyntheticMarkers::new("synthetic-markers", 0.4)) {
        log::warn!("continuing without markers: {err}");
    }
    session
        .set_transform(&TransformSpec::identity(CHANNELS, vec![CHANNELS - 1]))
        .context("identity transform rejected")?;
    let session = Arc::new(session);

    let analysis = AnalysisLoop::new(0.5)
        .with_limit(LoopLimit::Iterations(4))
        .spawn(Arc::clone(&session), |window| {
            let rms = window.to_matrix().mapv(|v| v * v).mean().unwrap_or(0.0).sqrt();
            println!(
                "window [{:.3}, {:.3}) {} x {} rms={rms:.2} markers={}",
                window.start_time,
                window.end_time,
                window.channel_count,
                window.sample_count(),
                window.markers.as_ref().map_or(0, Vec::len)
            );
        })
        .context("failed to start analysis loop")?;
    analysis.join();

    println!(
        "recorded {:.2} s, latency {:.1} ms",
        session.recording_duration(),
        session.latency()? * 1e3
    );

    let latest = session.window(2.0)?;
    for row in session.events(&latest, 0) {
        println!("event sample={} code={}", row.sample_index, row.code);
    }

    match session.epochs(0.1, 0.3) {
        Ok(epochs) => {
            let windows = epochs.iter().filter_map(Result::ok).collect::<Vec<_>>();
            println!("{} epochs available", windows.len());
            if let Some(first) = windows.first() {
                let volts = first.scaled_to_volts(session.info().unit);
                println!("{}", serde_json::to_string(&volts.export())?);
            }
        }
        Err(err) => log::warn!("no epochs: {err}"),
    }

    let record = session.model_record(
        "demo",
        "identity",
        4,
        serde_json::json!({ "kind": "none" }),
    )?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    session.disconnect();
    let stats = session.signal_stats();
    if stats.appended() == 0 {
        return Err(anyhow!("no samples were ingested"));
    }
    println!(
        "ingested {} samples in {} chunks ({} dropped)",
        stats.appended(),
        stats.chunks(),
        stats.dropped()
    );
    Ok(())
}
