use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use segmux::config::{CacheMode, Config};
use segmux::engine::{Engine, EngineSettings};
use segmux::manifest::{FragmentIndex, Retention};
use segmux::mux::PassthroughMuxer;
use segmux::notify::{FragmentListener, ListenerSet, LogListener};
use segmux::sink::{FileSink, MemorySink, SinkKind};
use segmux::source::SyntheticSource;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("segmux=debug".parse()?))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::info!("loaded {} stream(s)", config.streams.len());

    let (sink, retention) = match config.output.cache_mode {
        CacheMode::Disk => (
            SinkKind::File(FileSink::new(&config.output.directory)),
            Retention::Disk(config.output.directory.clone()),
        ),
        CacheMode::Memory => {
            let sink = MemorySink::new(config.output.memory_capacity_bytes);
            (SinkKind::Memory(sink.clone()), Retention::Memory(sink))
        }
    };
    let index = Arc::new(FragmentIndex::from_config(&config.playlist, retention));
    let listeners: Vec<Arc<dyn FragmentListener>> = vec![index.clone(), Arc::new(LogListener)];

    let engine = Engine::new(
        EngineSettings::from_config(&config)?,
        Box::new(PassthroughMuxer::new(sink)),
        Arc::new(ListenerSet::new(listeners)),
    );

    let sources: Vec<_> = config.streams.iter().map(SyntheticSource::from_config).collect();
    let mut streams = Vec::new();
    for source in &sources {
        streams.push(engine.attach_stream(source.spec())?);
    }
    let output = engine.start()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for (source, stream) in sources.into_iter().zip(streams) {
        let engine = engine.clone();
        let shutdown = Arc::clone(&shutdown);
        let name = source.name().to_string();
        let handle =
            tokio::task::spawn_blocking(move || source.run(&engine, stream, &shutdown, true));
        handles.push((name, handle));
    }

    let signal_flag = Arc::clone(&shutdown);
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_flag.store(true, Ordering::Relaxed);
        }
    });

    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(summary)) => tracing::info!(
                stream = %name,
                frames = summary.frames,
                desynchronized = summary.desynchronized,
                "source done"
            ),
            Ok(Err(e)) => tracing::error!(stream = %name, "source failed: {}", e),
            Err(e) => tracing::error!(stream = %name, "source task failed: {}", e),
        }
    }
    signal_handle.abort();

    let report = tokio::task::spawn_blocking(move || output.join()).await??;
    let stats = engine.stats();
    tracing::info!(
        fragments = report.fragments.len(),
        muxed_out_bytes = report.muxed_out_bytes,
        gops = stats.gops_gathered,
        indexed = index.entries().len(),
        first_sequence = index.first_sequence(),
        "shutdown complete"
    );

    Ok(())
}
