use std::{
    error::Error,
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use adcstream_core::{
    AcquireError, BufferPool, FillEngine, FillOutcome, PipelineConfig, PolledAcquisition,
    StreamWriter, WriterError,
};

use crate::{config::SimConfig, signal::SyntheticAdc, transport::IoTransport};

mod config;
mod signal;
mod transport;

const BUFFER_SAMPLES: usize = 1024;

static STOP: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = SimConfig::load(path.as_deref())?;
    let pipeline = config.pipeline.clone();
    pipeline.validate(BUFFER_SAMPLES)?;

    log::info!(
        "Sampling {} channel(s) at {} Hz ({} us per channel, {}-bit), {} samples ({} bytes) per block ({} ms)",
        pipeline.num_channels(),
        pipeline.sample_rate_hz,
        pipeline.channel_period().to_micros(),
        pipeline.sample_width.bits(),
        BUFFER_SAMPLES,
        pipeline.block_bytes(BUFFER_SAMPLES),
        pipeline.fill_period(BUFFER_SAMPLES).to_millis()
    );

    let pool: &'static BufferPool<BUFFER_SAMPLES> = Box::leak(Box::new(BufferPool::new()));
    let (producer, consumer) = pool.split().ok_or("buffer pool already in use")?;

    let output: Box<dyn Write> = match &config.output {
        Some(path) => {
            log::info!("Writing samples to {}", path.display());
            Box::new(File::create(path)?)
        }
        None => Box::new(io::stdout()),
    };
    let transport = IoTransport::new(BufWriter::new(output))
        .fail_every(config.transport_fail_every)
        .stall(config.writer_stall);
    let mut writer = StreamWriter::new(
        consumer,
        transport,
        pipeline.sample_width,
        pipeline.retry,
    );

    let adc = SyntheticAdc::new(&config);
    let fill = FillEngine::new(producer, pipeline.overrun_policy);
    let filler = std::thread::spawn(move || acquire(fill, adc, &pipeline));

    let result = tokio::select! {
        result = writer.run_async() => Some(result),
        _ = tokio::time::sleep(Duration::from_millis(config.duration_ms)) => None,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted");
            None
        }
    };

    STOP.store(true, Ordering::Relaxed);
    let filled = filler
        .join()
        .map_err(|_| "acquisition thread panicked")?;

    match result {
        Some(Ok(never)) => match never {},
        Some(Err(WriterError::Halted { .. })) | None => {}
        Some(Err(e)) => {
            log::error!("Stream writer gave up: {e}");
            return Err(e.into());
        }
    }

    // Whatever was published before the stop
    loop {
        match writer.poll() {
            Ok(report) if report.delivered > 0 => {}
            Ok(_) | Err(WriterError::Halted { .. }) => break,
            Err(e) => return Err(e.into()),
        }
    }

    let stats = *writer.stats();
    let faults = pool.faults().snapshot();
    writer.into_transport().into_inner().flush()?;

    log::info!(
        "Filled {} blocks, delivered {} ({} bytes, {} retries)",
        filled,
        stats.blocks,
        stats.bytes,
        stats.retries
    );
    log::info!(
        "Faults: {} overruns, {} dropped blocks ({} samples), {} conversion errors{}",
        faults.overruns,
        faults.dropped_blocks,
        faults.dropped_samples,
        faults.conversion_errors,
        if faults.halted { ", halted" } else { "" }
    );

    Ok(())
}

/// Stand-in for the conversion interrupt: fills one block per fill period
/// until told to stop or the engine halts. Returns the number of blocks
/// filled.
fn acquire(
    fill: FillEngine<'static, BUFFER_SAMPLES>,
    adc: SyntheticAdc,
    pipeline: &PipelineConfig,
) -> u32 {
    let mut acquisition = PolledAcquisition::new(adc, fill, pipeline.num_channels());
    if let Err(e) = acquisition.start() {
        log::error!("Failed to start acquisition: {e}");
        return 0;
    }

    let period = Duration::from_nanos(pipeline.fill_period(BUFFER_SAMPLES).ticks());
    let mut deadline = Instant::now();

    while !STOP.load(Ordering::Relaxed) {
        match acquisition.acquire_block() {
            Ok(FillOutcome::Halted { .. }) | Err(AcquireError::Stopped) => break,
            Ok(_) => {}
            // Already counted, the block picks up where it left off
            Err(AcquireError::Source(_) | AcquireError::HandshakeTimeout) => continue,
            Err(AcquireError::Fill(_)) => break,
        }

        deadline += period;
        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }

    acquisition.fill().sequence()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_that_can_not_start_fills_nothing() {
        let config = SimConfig::default();
        let pool: &'static BufferPool<BUFFER_SAMPLES> = Box::leak(Box::new(BufferPool::new()));
        let (producer, _consumer) = pool.split().unwrap();

        // Arming twice is refused
        let mut fill = FillEngine::new(producer, config.pipeline.overrun_policy);
        fill.start().unwrap();

        assert_eq!(acquire(fill, SyntheticAdc::new(&config), &config.pipeline), 0);
        assert_eq!(pool.faults().snapshot().overruns, 0);
    }
}
