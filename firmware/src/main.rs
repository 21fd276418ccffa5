#![no_main]
#![no_std]
#![feature(type_alias_impl_trait)]

use adcstream_core::{
    BufferPool, ChannelSequencer, ConversionSource, Faults, FillEngine, OverrunPolicy,
    PipelineConfig, RetryPolicy, SampleWidth, StreamWriter, WriterError,
};
use defmt::{unwrap, Debug2Format};
use defmt_rtt as _;
use panic_probe as _;
use rtic::{app, Mutex};
use rtic_monotonics::{
    systick::{ExtU64, Systick},
    Monotonic,
};
use static_cell::StaticCell;
use stm32f7xx_hal::{
    gpio::{Alternate, Output, Pin},
    pac,
    prelude::*,
    serial::Serial,
};

use adcstream_firmware::{
    adc_capture::{Adc1Source, AdcCapture, DmaFill, SampleClock, CONVERSION_TIME_NS},
    serial::SerialTransport,
};

defmt::timestamp!("{=u64:ms}", Systick::now().duration_since_epoch().to_millis());

const BUFFER_SAMPLES: usize = 1024;
const SAMPLE_RATE_HZ: u32 = 4_000;
/// PA3 and PC0
const CHANNEL_INPUTS: [u8; 2] = [3, 10];
/// USART3 runs at the HAL default of 115200 baud, 8N1
const TRANSPORT_BYTES_PER_SEC: u32 = 115_200 / 10;

type Uart = Serial<pac::USART3, (Pin<'D', 8, Alternate<7>>, Pin<'D', 9, Alternate<7>>)>;
type Writer = StreamWriter<'static, SerialTransport<Uart>, BUFFER_SAMPLES>;

/// The input multiplexer: ADC1 plus the sequencer that switches it.
pub struct Multiplexer {
    sequencer: ChannelSequencer,
    adc: Adc1Source,
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        sample_rate_hz: SAMPLE_RATE_HZ,
        channel_inputs: unwrap!(heapless::Vec::from_slice(&CHANNEL_INPUTS).ok()),
        sample_width: SampleWidth::Bits12,
        conversion_time_ns: CONVERSION_TIME_NS,
        transport_bytes_per_sec: Some(TRANSPORT_BYTES_PER_SEC),
        overrun_policy: OverrunPolicy::DropOldest,
        retry: RetryPolicy {
            max_attempts: 3,
            backpressure_spins: 100_000,
        },
    }
}

#[app(device = stm32f7xx_hal::pac, dispatchers = [CAN1_RX0])]
mod app {
    use super::*;

    static POOL: StaticCell<BufferPool<BUFFER_SAMPLES>> = StaticCell::new();

    #[shared]
    struct Shared {
        fill: FillEngine<'static, BUFFER_SAMPLES>,
        mux: Multiplexer,
    }

    #[local]
    struct Local {
        dma: DmaFill<BUFFER_SAMPLES>,
        clock: SampleClock,
        writer: Writer,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        let p = cx.device;

        // Refuse to arm anything with a configuration that can not keep up
        let config = pipeline_config();
        if let Err(e) = config.validate(BUFFER_SAMPLES) {
            defmt::panic!("Invalid pipeline configuration: {}", e);
        }

        let mut rcc = p.RCC.constrain();
        let clocks = rcc.cfgr.sysclk(216.MHz()).hclk(216.MHz()).freeze();
        defmt::println!("Clocks: {:?}", Debug2Format(&clocks));

        // Setup systick to be used for delays
        let systick_token = rtic_monotonics::create_systick_token!();
        Systick::start(cx.core.SYST, clocks.sysclk().to_Hz(), systick_token);

        // Forward the pipeline's own logs
        log_to_defmt::setup();

        let gpioa = p.GPIOA.split();
        let gpiob = p.GPIOB.split();
        let gpioc = p.GPIOC.split();
        let gpiod = p.GPIOD.split();

        let _adc1_in3 = gpioa.pa3.into_analog();
        let _adc1_in10 = gpioc.pc0.into_analog();

        let led_blue = gpiob.pb7.into_push_pull_output();
        let led_red = gpiob.pb14.into_push_pull_output();

        let uart: Uart = Serial::new(
            p.USART3,
            (gpiod.pd8.into_alternate(), gpiod.pd9.into_alternate()),
            &clocks,
            Default::default(),
        );

        let pool: &'static BufferPool<BUFFER_SAMPLES> = POOL.init_with(BufferPool::new);
        let (producer, consumer) = unwrap!(pool.split());

        let AdcCapture {
            mut dma,
            adc,
            mut clock,
        } = AdcCapture::init(
            p.ADC1,
            p.TIM2,
            p.DMA2,
            &config,
            clocks.timclk1(),
            &mut rcc.apb1,
            &mut rcc.apb2,
            &mut rcc.ahb1,
        );

        let mut fill = FillEngine::new(producer, config.overrun_policy);
        unwrap!(fill.start());
        let Some(first) = fill.dma_target() else {
            defmt::panic!("Fill engine did not arm a slot");
        };
        // SAFETY: the fill engine owns the active slot until the transfer
        // completes
        unsafe { dma.start(first) };

        let mut mux = Multiplexer {
            sequencer: ChannelSequencer::new(config.num_channels()),
            adc,
        };
        mux.sequencer.arm(&mut mux.adc);
        mux.adc.set_free_running(true);

        let writer = StreamWriter::new(
            consumer,
            SerialTransport::new(uart),
            config.sample_width,
            config.retry,
        );

        defmt::info!(
            "Sampling {} channels at {} Hz ({}-bit), {} samples per block",
            config.num_channels(),
            config.sample_rate_hz,
            config.sample_width.bits(),
            BUFFER_SAMPLES
        );
        clock.start();

        stream_writer::spawn().unwrap_or_else(|_| defmt::panic!("Failed to start stream_writer"));
        heartbeat::spawn(led_blue, led_red, pool.faults())
            .unwrap_or_else(|_| defmt::panic!("Failed to start heartbeat"));

        (Shared { fill, mux }, Local { dma, clock, writer })
    }

    /// Drain completed blocks to the UART
    #[task(local = [writer], priority = 0)]
    async fn stream_writer(cx: stream_writer::Context) {
        let writer = cx.local.writer;

        match writer.run_async().await {
            Ok(never) => match never {},
            Err(WriterError::Halted { overruns }) => {
                defmt::warn!("Acquisition halted after {} overruns", overruns)
            }
            Err(e) => defmt::error!("Stream writer stopped: {}", Debug2Format(&e)),
        }

        defmt::info!("Final writer stats: {}", writer.stats());
    }

    /// Blinks the blue LED while running, the red one lights up once
    /// acquisition halted. Runs above the writer, which spins while the UART
    /// is busy.
    #[task(priority = 1)]
    async fn heartbeat(
        _cx: heartbeat::Context,
        mut blue: Pin<'B', 7, Output>,
        mut red: Pin<'B', 14, Output>,
        faults: &'static Faults,
    ) {
        loop {
            blue.toggle();
            if faults.is_halted() {
                red.set_high();
            }
            Systick::delay(500u64.millis()).await;
        }
    }

    /// A block is complete: publish it and point the stream at the next slot
    #[task(binds = DMA2_STREAM0, local = [dma], shared = [fill, mux], priority = 2)]
    fn on_dma2_stream0(cx: on_dma2_stream0::Context) {
        let dma = cx.local.dma;
        let flags = dma.take_flags();

        (cx.shared.fill, cx.shared.mux).lock(|fill, mux| {
            if flags.error {
                fill.record_conversion_error();
            }
            if !flags.complete {
                return;
            }

            fill.on_transfer_complete();
            match fill.dma_target() {
                // SAFETY: the fill engine just made this the active slot
                Some(next) => unsafe { dma.start(next) },
                None => {
                    dma.stop();
                    mux.adc.set_free_running(false);
                }
            }
        });
    }

    /// Half a sample period after every conversion: switch inputs
    #[task(binds = TIM2, local = [clock], shared = [mux], priority = 2)]
    fn on_sample_clock(mut cx: on_sample_clock::Context) {
        if cx.local.clock.take_tick() {
            cx.shared.mux.lock(|mux| {
                mux.sequencer.tick(&mut mux.adc);
            });
        }
    }

    /// ADC1 data overrun: the conversion is lost, so convert the same input
    /// again
    #[task(binds = ADC, shared = [fill, mux], priority = 2)]
    fn on_adc1_overrun(cx: on_adc1_overrun::Context) {
        (cx.shared.fill, cx.shared.mux).lock(|fill, mux| {
            if mux.adc.recover_overrun() {
                fill.record_conversion_error();
                mux.sequencer.hold();
            }
        });
    }
}
