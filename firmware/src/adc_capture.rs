use adcstream_core::{config::MAX_CHANNELS, ConversionSource, PipelineConfig, Sample};
use fugit::HertzU32;
use hal::{
    pac,
    rcc::{self, Enable, Reset, APB2},
};
use heapless::Vec;
use stm32f7xx_hal as hal;

/// ADC1 sampling time code for 144 cycles, applied to every input.
const SAMPLE_TIME_144_CYCLES: u32 = 0b110;

/// Worst case conversion time: 144 sampling plus 12 conversion cycles of the
/// 27 MHz ADC clock (PCLK2 / 4).
pub const CONVERSION_TIME_NS: u32 = 5_800;

/// External trigger selection for TIM2 TRGO.
const EXTSEL_TIM2_TRGO: u8 = 0b1011;

/// Sampling time code repeated for `fields` inputs of an SMPRx register.
const fn sample_times(code: u32, fields: u32) -> u32 {
    let mut bits = 0;
    let mut i = 0;
    while i < fields {
        bits |= code << (3 * i);
        i += 1;
    }
    bits
}

/// TIM2 auto-reload value for one update per sample.
pub fn sample_clock_reload(timer_clock: HertzU32, sample_rate: HertzU32) -> u32 {
    (timer_clock.to_Hz() / sample_rate.to_Hz().max(1)).saturating_sub(1)
}

/// ADC1 converting on every TIM2 update, with DMA2 stream 0 moving the
/// results into whichever slot the fill engine hands out.
///
/// The parts are split up so each can be owned by the interrupt that uses
/// it.
pub struct AdcCapture<const N: usize> {
    pub dma: DmaFill<N>,
    pub adc: Adc1Source,
    pub clock: SampleClock,
}

impl<const N: usize> AdcCapture<N> {
    /// Configure all three peripherals. Nothing converts until
    /// [`SampleClock::start`] is called.
    pub fn init(
        adc1: pac::ADC1,
        tim2: pac::TIM2,
        dma2: pac::DMA2,
        config: &PipelineConfig,
        timer_clock: HertzU32,
        apb1: &mut rcc::APB1,
        apb2: &mut rcc::APB2,
        ahb1: &mut rcc::AHB1,
    ) -> Self {
        let dma = DmaFill::init(dma2, adc1.dr.as_ptr() as u32, ahb1);
        let adc = Adc1Source::init(adc1, config.channel_inputs.clone(), apb2);
        let clock = SampleClock::init(
            tim2,
            sample_clock_reload(timer_clock, config.sample_rate()),
            apb1,
        );

        Self { dma, adc, clock }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, defmt::Format)]
pub struct DmaFlags {
    pub complete: bool,
    pub error: bool,
}

/// DMA2 stream 0, one block at a time.
///
/// The stream runs in normal (non-circular) mode and stops after `N`
/// transfers, so it never writes anywhere it was not explicitly pointed at.
pub struct DmaFill<const N: usize> {
    dma2: pac::DMA2,
}

impl<const N: usize> DmaFill<N> {
    const TRANSFERS: u16 = {
        assert!(N > 0 && N <= u16::MAX as usize);
        N as u16
    };

    /// Configure DMA2 Stream 0 to move 16-bit conversions from ADC1 into
    /// memory
    fn init(dma2: pac::DMA2, peripheral_address: u32, ahb1: &mut rcc::AHB1) -> Self {
        <pac::DMA2 as Enable>::enable(ahb1);

        let stream = &dma2.st[0];
        stream.cr.modify(|_, w| w.en().disabled());
        while stream.cr.read().en().is_enabled() {}

        stream.cr.modify(|_, w| {
            // Select channel 0 (ADC1)
            w.chsel()
                .bits(0)
                .dbm()
                .disabled()
                .circ()
                .disabled()
                .msize()
                .bits16()
                .psize()
                .bits16()
                .minc()
                .incremented()
                .pinc()
                .fixed()
                .dir()
                .peripheral_to_memory()
                // Stop after NDTR transfers
                .pfctrl()
                .dma()
                .tcie()
                .enabled()
                .teie()
                .enabled()
                .dmeie()
                .enabled()
                .ct()
                .memory0()
        });

        stream
            .par
            .write(|w| unsafe { w.pa().bits(peripheral_address) });

        Self { dma2 }
    }

    /// Point the stream at `target` and enable it.
    ///
    /// # Safety
    ///
    /// `target` must be valid for `N` samples and must not be read or written
    /// by anyone else until the next transfer complete.
    pub unsafe fn start(&mut self, target: *mut Sample) {
        let stream = &self.dma2.st[0];

        self.clear_flags();
        stream.m0ar.write(|w| w.m0a().bits(target as u32));
        stream.ndtr.write(|w| w.ndt().bits(Self::TRANSFERS));
        stream.cr.modify(|_, w| w.en().enabled());
    }

    pub fn stop(&mut self) {
        self.dma2.st[0].cr.modify(|_, w| w.en().disabled());
    }

    /// Read and clear the interrupt flags of stream 0.
    pub fn take_flags(&mut self) -> DmaFlags {
        let lisr = self.dma2.lisr.read();
        let flags = DmaFlags {
            complete: lisr.tcif0().bit_is_set(),
            error: lisr.teif0().bit_is_set() || lisr.dmeif0().bit_is_set(),
        };
        self.clear_flags();
        flags
    }

    fn clear_flags(&mut self) {
        self.dma2.lifcr.write(|w| {
            w.ctcif0()
                .set_bit()
                .chtif0()
                .set_bit()
                .cteif0()
                .set_bit()
                .cdmeif0()
                .set_bit()
                .cfeif0()
                .set_bit()
        });
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
pub enum AdcError {
    /// A conversion finished before the previous result was read.
    Overrun,
}

/// ADC1 with a logical channel to input pin mapping.
pub struct Adc1Source {
    adc1: pac::ADC1,
    inputs: Vec<u8, MAX_CHANNELS>,
}

impl Adc1Source {
    /// Configure ADC1 to 12-bits resolution in single conversion mode,
    /// triggered externally from TIM2 TRGO and read out using DMA
    fn init(adc1: pac::ADC1, inputs: Vec<u8, MAX_CHANNELS>, apb2: &mut APB2) -> Self {
        <pac::ADC1 as Enable>::enable(apb2);
        // Power down ADC1
        adc1.cr2.modify(|_, w| w.adon().clear_bit());
        <pac::ADC1 as Reset>::reset(apb2);

        // ADC clock is PCLK2 / 4
        let common = unsafe { &*pac::ADC_COMMON::ptr() };
        common.ccr.modify(|_, w| w.adcpre().div4());

        // One conversion per trigger, a single input at a time
        adc1.cr2.modify(|_, w| w.cont().single());
        adc1.cr1
            .modify(|_, w| w.scan().clear_bit().discen().clear_bit());
        adc1.sqr1.modify(|_, w| unsafe { w.l().bits(0) });

        adc1.cr1.modify(|_, w| w.res().bits(0b00));

        adc1.smpr1
            .write(|w| unsafe { w.bits(sample_times(SAMPLE_TIME_144_CYCLES, 9)) });
        adc1.smpr2
            .write(|w| unsafe { w.bits(sample_times(SAMPLE_TIME_144_CYCLES, 10)) });

        // Keep requesting DMA transfers after every conversion
        adc1.cr2.modify(|_, w| w.dma().enabled().dds().continuous());

        // Only the overrun interrupt, results are picked up by DMA
        adc1.cr1
            .modify(|_, w| w.eocie().disabled().ovrie().enabled());

        adc1.cr2.modify(|_, w| w.adon().enabled());

        Self { adc1, inputs }
    }

    /// Clear a data overrun and resume DMA requests. Returns whether there
    /// was one.
    pub fn recover_overrun(&mut self) -> bool {
        if self.adc1.sr.read().ovr().bit_is_clear() {
            return false;
        }

        self.adc1.sr.modify(|_, w| w.ovr().clear_bit());
        self.adc1.cr2.modify(|_, w| w.dma().disabled());
        self.adc1.cr2.modify(|_, w| w.dma().enabled());
        true
    }
}

impl ConversionSource for Adc1Source {
    type Error = AdcError;

    fn select_channel(&mut self, index: u8) {
        if let Some(&input) = self.inputs.get(usize::from(index)) {
            self.adc1.sqr3.modify(|_, w| unsafe { w.sq1().bits(input) });
        }
    }

    fn start_conversion(&mut self) {
        self.adc1.cr2.modify(|_, w| w.swstart().start());
    }

    fn read(&mut self) -> nb::Result<Sample, Self::Error> {
        let sr = self.adc1.sr.read();
        if sr.ovr().bit_is_set() {
            self.adc1.sr.modify(|_, w| w.ovr().clear_bit());
            return Err(nb::Error::Other(AdcError::Overrun));
        }
        if sr.eoc().bit_is_clear() {
            return Err(nb::Error::WouldBlock);
        }

        // Reading DR clears EOC
        Ok(self.adc1.dr.read().data().bits())
    }

    /// Follow TIM2 TRGO instead of software starts.
    fn set_free_running(&mut self, enabled: bool) {
        if enabled {
            self.adc1.cr2.modify(|_, w| unsafe {
                w.exten().rising_edge().extsel().bits(EXTSEL_TIM2_TRGO)
            });
        } else {
            self.adc1.cr2.modify(|_, w| w.exten().disabled());
        }
    }
}

/// TIM2 as the sample clock.
///
/// Every update event triggers a conversion through TRGO. Compare channel 1
/// fires half a period later, when the conversion is long done, and is where
/// the multiplexer gets switched to the next input.
pub struct SampleClock {
    tim2: pac::TIM2,
}

impl SampleClock {
    fn init(tim2: pac::TIM2, reload: u32, apb1: &mut rcc::APB1) -> Self {
        <pac::TIM2 as Enable>::enable(apb1);

        tim2.cr1.modify(|_, w| w.cen().disabled());
        // TRGO on update
        tim2.cr2.modify(|_, w| w.mms().update());
        tim2.arr.write(|w| w.arr().bits(reload));
        tim2.ccr1.write(|w| unsafe { w.ccr().bits(reload / 2) });
        tim2.dier.modify(|_, w| w.cc1ie().enabled());

        Self { tim2 }
    }

    /// Start counting just past the compare point, so the first event is an
    /// update that converts on the input selected when arming.
    pub fn start(&mut self) {
        let compare = self.tim2.ccr1.read().ccr().bits();
        self.tim2.cnt.write(|w| unsafe { w.bits(compare + 1) });
        self.tim2.cr1.modify(|_, w| w.cen().enabled());
    }

    /// Acknowledge the interrupt. Returns whether it was the compare event
    /// that switches inputs.
    pub fn take_tick(&mut self) -> bool {
        let tick = self.tim2.sr.read().cc1if().bit_is_set();
        self.tim2
            .sr
            .modify(|_, w| w.cc1if().clear_bit().uif().clear_bit());
        tick
    }
}
