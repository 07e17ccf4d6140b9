//! Sink events are mirrored into `tracing` with their destination.

use kvprobe_core::{
    AlwaysContinue, BackendKind, MemoryBackend, MemoryLimits, ProbeConfig, ProbeSession,
    RecordingSink,
};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct MockWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MockWriter {
    type Writer = MockWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn setup_capture(filter: &str) -> (MockWriter, tracing::subscriber::DefaultGuard) {
    let writer = MockWriter {
        buf: Arc::new(Mutex::new(Vec::new())),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_env_filter(EnvFilter::new(filter))
        .with_ansi(false)
        .finish();
    (writer, tracing::subscriber::set_default(subscriber))
}

fn output(writer: &MockWriter) -> String {
    String::from_utf8(writer.buf.lock().unwrap().clone()).unwrap()
}

#[tokio::test]
async fn limit_error_is_mirrored_at_error_level() {
    let (writer, _guard) = setup_capture("warn");
    let mut config = ProbeConfig::default();
    config.backend.kind = BackendKind::Memory;
    config.capacity.unit_bytes = 1;
    let backend = MemoryBackend::new(MemoryLimits {
        quota_bytes: Some(15),
        ..Default::default()
    });
    let session = ProbeSession::new(
        config,
        Arc::new(backend),
        Arc::new(RecordingSink::new()),
        Arc::new(AlwaysContinue),
    );

    session.run_capacity().await.unwrap();

    let out = output(&writer);
    assert!(out.contains("ERROR"), "{out}");
    assert!(out.contains("destination=\"capacity\""), "{out}");
    assert!(out.contains("Quota exceeded"), "{out}");
    assert!(!out.contains("Starting capacity test"), "debug lines leaked: {out}");
}

#[tokio::test]
async fn debug_filter_includes_progress_lines_and_probe_span() {
    let (writer, _guard) = setup_capture("kvprobe_core=debug");
    let mut config = ProbeConfig::default();
    config.backend.kind = BackendKind::Memory;
    config.capacity.unit_bytes = 1;
    config.capacity.target_mb = 10;
    let session = ProbeSession::new(
        config,
        Arc::new(MemoryBackend::default()),
        Arc::new(RecordingSink::new()),
        Arc::new(AlwaysContinue),
    );

    session.run_capacity().await.unwrap();

    let out = output(&writer);
    assert!(out.contains("Starting capacity test"), "{out}");
    assert!(out.contains("probe{kind=Capacity}"), "{out}");
    assert!(out.contains("probe finished"), "{out}");
}
