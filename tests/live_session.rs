use neurowindow::drivers::{ChannelSource, IngestState, TransformSpec};
use neurowindow::{
    MarkerEvent, Retention, Sample, SessionConfig, StreamError, StreamInfo, StreamSession,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CHANNELS: usize = 4;
const RATE: f64 = 256.0;

fn config() -> SessionConfig {
    SessionConfig {
        signal_retention: Retention::Seconds(4.0),
        marker_retention: Retention::Entries(64),
        poll_timeout_ms: 5,
        ..SessionConfig::default()
    }
}

#[test]
fn concurrent_ingest_and_reads_stay_consistent() {
    let (signal_tx, signal_source) = ChannelSource::bounded("eeg", 16);
    let (marker_tx, marker_source) = ChannelSource::unbounded("markers");
    let info = StreamInfo::new("eeg", StreamInfo::default_labels(CHANNELS), RATE);
    let mut session = StreamSession::connect(info, &config(), signal_source).unwrap();
    session.attach_markers(marker_source).unwrap();
    session
        .set_transform(&TransformSpec::identity(CHANNELS, vec![2]))
        .unwrap();
    let session = Arc::new(session);

    // 10 s of data in 32-sample chunks, replaying the first half of every
    // tenth chunk late, and a marker every second.
    let producer = thread::spawn(move || {
        let mut index = 0u64;
        for chunk_no in 0..80 {
            let chunk: Vec<Sample> = (0..32)
                .map(|k| {
                    let t = (index + k) as f64 / RATE;
                    Sample::new(t, vec![t; CHANNELS])
                })
                .collect();
            index += 32;
            if chunk_no % 8 == 0 {
                let t = index as f64 / RATE;
                marker_tx.send(vec![MarkerEvent::code(t, 1 + (chunk_no / 8) % 2)]).unwrap();
            }
            let replay = chunk[..16].to_vec();
            signal_tx.send(chunk).unwrap();
            if chunk_no % 10 == 9 {
                signal_tx.send(replay).unwrap();
            }
            thread::sleep(Duration::from_millis(1));
        }
    });

    let reader = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let mut reads = 0;
            let deadline = Instant::now() + Duration::from_secs(10);
            while reads < 200 && Instant::now() < deadline {
                match session.window(0.25) {
                    Ok(window) => {
                        assert_eq!(window.channel_count, CHANNELS - 1);
                        assert!(window.samples.iter().all(|s| s.values.len() == CHANNELS - 1));
                        assert!(window
                            .samples
                            .windows(2)
                            .all(|w| w[0].timestamp < w[1].timestamp));
                        // Identity transform: every kept value equals its timestamp.
                        assert!(window
                            .samples
                            .iter()
                            .all(|s| s.values.iter().all(|v| *v == s.timestamp)));
                        reads += 1;
                    }
                    Err(err) => assert!(err.is_retryable(), "unexpected {err}"),
                }
            }
            reads
        })
    };

    producer.join().unwrap();
    assert!(reader.join().unwrap() > 0);

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.signal_state() != IngestState::Stopped {
        assert!(Instant::now() < deadline, "ingest did not see the source close");
        thread::sleep(Duration::from_millis(1));
    }

    let stats = session.signal_stats();
    assert_eq!(stats.appended(), 80 * 32);
    assert_eq!(stats.dropped(), 8 * 16);

    let buffer = session.signal_buffer();
    let (earliest, latest) = buffer.bounds().unwrap();
    assert!(earliest >= latest - 4.0);

    let epochs = session.epochs(0.25, 0.25).unwrap();
    let windows: Vec<_> = epochs.iter().collect::<Result<Vec<_>, StreamError>>().unwrap();
    let markers_in_range = session
        .marker_buffer()
        .unwrap()
        .slice_through(earliest, latest)
        .len();
    assert_eq!(windows.len(), markers_in_range);
    assert!(windows.iter().all(|w| (w.duration() - 0.5).abs() < 1e-9));

    let record = session
        .model_record("p300", "ica", windows.len(), serde_json::Value::Null)
        .unwrap();
    assert_eq!(record.n_features, CHANNELS - 1);

    session.disconnect();
    assert_eq!(session.signal_state(), IngestState::Stopped);
}
