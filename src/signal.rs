//! Per-channel sample sources and sinks.
//!
//! A [`Signal`] is one sourced or measured quantity on one channel. The codec
//! pulls exactly one value from the source for every outgoing wire slot and
//! pushes exactly one value into the sink for every incoming wire slot.

use std::{
    f64::consts::PI,
    fmt,
    sync::{Arc, Mutex},
};

use crate::error::{Error, Result};

/// Channel operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Mode {
    /// Channel is floating.
    #[default]
    Disabled = 0,
    /// Source voltage, measure current.
    Svmi = 1,
    /// Source current, measure voltage.
    Simv = 2,
}

impl Mode {
    pub(crate) fn mask(self) -> u32 {
        1 << self as u32
    }
}

impl TryFrom<u8> for Mode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Mode::Disabled),
            1 => Ok(Mode::Svmi),
            2 => Ok(Mode::Simv),
            v => Err(Error::InvalidArgument(format!("unknown channel mode {}", v))),
        }
    }
}

/// Physical quantity carried by a signal. Doubles as the signal index within
/// a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Voltage = 0,
    Current = 1,
}

impl Quantity {
    pub fn unit(self) -> &'static str {
        match self {
            Quantity::Voltage => "V",
            Quantity::Current => "A",
        }
    }
}

/// Static descriptor of a signal, fixed per hardware family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalInfo {
    pub label: &'static str,
    pub quantity: Quantity,
    /// Bitmask of modes in which this signal is measured.
    pub input_modes: u32,
    /// Bitmask of modes in which this signal is sourced.
    pub output_modes: u32,
    pub min: f64,
    pub max: f64,
    pub resolution: f64,
}

impl SignalInfo {
    pub fn is_input(&self, mode: Mode) -> bool {
        self.input_modes & mode.mask() != 0
    }

    pub fn is_output(&self, mode: Mode) -> bool {
        self.output_modes & mode.mask() != 0
    }

    /// Clamp a value into the signal's declared range.
    pub fn constrain(&self, value: f32) -> f32 {
        value.clamp(self.min as f32, self.max as f32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Square,
    Sawtooth,
    Stairstep,
    Sine,
    Triangle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Periodic {
    pub kind: Waveform,
    pub midpoint: f32,
    pub peak: f32,
    /// Samples per cycle, may be non-integral.
    pub period: f64,
    /// Current position within the cycle, in samples.
    pub phase: f64,
    /// Fraction of the cycle spent at `midpoint` (square only).
    pub duty: f64,
}

impl Periodic {
    fn next(&mut self) -> f32 {
        let peak_to_peak = (self.peak - self.midpoint) as f64;
        let phase = self.phase;
        let mut norm_phase = phase / self.period;
        if norm_phase < 0.0 {
            norm_phase += 1.0;
        }
        self.phase = (self.phase + 1.0) % self.period;

        let value = match self.kind {
            Waveform::Square => {
                if norm_phase < self.duty {
                    self.midpoint as f64
                } else {
                    self.peak as f64
                }
            }
            Waveform::Sawtooth => {
                let int_period = self.period.trunc();
                let int_phase = phase.trunc();
                let frac_period = self.period - int_period;
                let frac_phase = phase - int_phase;
                // highest integer phase reached within one cycle
                let max_int_phase = if frac_period <= frac_phase {
                    int_period - 1.0
                } else {
                    int_period
                };
                if max_int_phase <= 0.0 {
                    self.peak as f64
                } else {
                    self.peak as f64 - int_phase / max_int_phase * peak_to_peak
                }
            }
            Waveform::Stairstep => {
                self.peak as f64 - (norm_phase * 10.0).floor() * peak_to_peak / 9.0
            }
            Waveform::Sine => {
                self.midpoint as f64 + (1.0 + (norm_phase * 2.0 * PI).cos()) * peak_to_peak / 2.0
            }
            Waveform::Triangle => {
                self.midpoint as f64 + (1.0 - norm_phase * 2.0).abs() * peak_to_peak
            }
        };
        value as f32
    }
}

pub type SourceFn = Box<dyn FnMut(u64) -> f32 + Send>;
pub type SinkFn = Box<dyn FnMut(f32) + Send>;

/// Where outgoing samples come from.
pub enum Source {
    Constant(f32),
    Periodic(Periodic),
    Buffer {
        data: Vec<f32>,
        cursor: usize,
        repeat: bool,
    },
    Callback {
        f: SourceFn,
        index: u64,
    },
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            Source::Periodic(p) => f.debug_tuple("Periodic").field(p).finish(),
            Source::Buffer { data, cursor, repeat } => f
                .debug_struct("Buffer")
                .field("len", &data.len())
                .field("cursor", cursor)
                .field("repeat", repeat)
                .finish(),
            Source::Callback { index, .. } => {
                f.debug_struct("Callback").field("index", index).finish()
            }
        }
    }
}

/// Bounded buffer collecting measured samples, shared between the signal
/// sink and the caller.
#[derive(Debug, Clone)]
pub struct MeasureBuffer {
    data: Arc<Mutex<Vec<f32>>>,
    capacity: usize,
}

impl MeasureBuffer {
    fn new(capacity: usize) -> Self {
        MeasureBuffer {
            data: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, value: f32) {
        if let Ok(mut data) = self.data.lock() {
            // samples beyond capacity are dropped
            if data.len() < self.capacity {
                data.push(value);
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Copy of everything collected so far.
    pub fn samples(&self) -> Vec<f32> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Remove and return everything collected so far, making room for more.
    pub fn take(&self) -> Vec<f32> {
        self.data
            .lock()
            .map(|mut d| std::mem::take(&mut *d))
            .unwrap_or_default()
    }
}

/// Where incoming samples go.
pub enum Sink {
    None,
    Buffer(MeasureBuffer),
    Callback(SinkFn),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::None => f.write_str("None"),
            Sink::Buffer(b) => f.debug_tuple("Buffer").field(&b.capacity).finish(),
            Sink::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[derive(Debug)]
pub struct Signal {
    info: &'static SignalInfo,
    source: Source,
    sink: Sink,
    latest: f32,
}

impl Signal {
    pub(crate) fn new(info: &'static SignalInfo) -> Self {
        Signal {
            info,
            source: Source::Constant(0.0),
            sink: Sink::None,
            latest: 0.0,
        }
    }

    pub fn info(&self) -> &'static SignalInfo {
        self.info
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn source_constant(&mut self, value: f32) {
        self.source = Source::Constant(value);
    }

    fn source_periodic(
        &mut self,
        kind: Waveform,
        midpoint: f32,
        peak: f32,
        period: f64,
        phase: f64,
        duty: f64,
    ) -> Result<()> {
        if !(period > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "waveform period must be positive, got {}",
                period
            )));
        }
        self.source = Source::Periodic(Periodic {
            kind,
            midpoint,
            peak,
            period,
            phase: phase.rem_euclid(period),
            duty,
        });
        Ok(())
    }

    pub fn source_square(
        &mut self,
        midpoint: f32,
        peak: f32,
        period: f64,
        duty: f64,
        phase: f64,
    ) -> Result<()> {
        self.source_periodic(Waveform::Square, midpoint, peak, period, phase, duty)
    }

    pub fn source_sawtooth(&mut self, midpoint: f32, peak: f32, period: f64, phase: f64) -> Result<()> {
        self.source_periodic(Waveform::Sawtooth, midpoint, peak, period, phase, 0.5)
    }

    pub fn source_stairstep(&mut self, midpoint: f32, peak: f32, period: f64, phase: f64) -> Result<()> {
        self.source_periodic(Waveform::Stairstep, midpoint, peak, period, phase, 0.5)
    }

    /// Cosine-shaped: the first sample is `peak`.
    pub fn source_sine(&mut self, midpoint: f32, peak: f32, period: f64, phase: f64) -> Result<()> {
        self.source_periodic(Waveform::Sine, midpoint, peak, period, phase, 0.5)
    }

    pub fn source_triangle(&mut self, midpoint: f32, peak: f32, period: f64, phase: f64) -> Result<()> {
        self.source_periodic(Waveform::Triangle, midpoint, peak, period, phase, 0.5)
    }

    /// Play back `data`; when exhausted either start over or hold the last value.
    pub fn source_buffer(&mut self, data: Vec<f32>, repeat: bool) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty source buffer".into()));
        }
        self.source = Source::Buffer {
            data,
            cursor: 0,
            repeat,
        };
        Ok(())
    }

    pub fn source_callback<F>(&mut self, f: F)
    where
        F: FnMut(u64) -> f32 + Send + 'static,
    {
        self.source = Source::Callback {
            f: Box::new(f),
            index: 0,
        };
    }

    /// Re-phase a periodic source without changing its shape.
    pub fn update_phase(&mut self, period: f64, phase: f64) -> Result<()> {
        match &mut self.source {
            Source::Periodic(p) if period > 0.0 => {
                p.period = period;
                p.phase = phase.rem_euclid(period);
                Ok(())
            }
            Source::Periodic(_) => Err(Error::InvalidArgument(format!(
                "waveform period must be positive, got {}",
                period
            ))),
            _ => Err(Error::InvalidArgument("source is not periodic".into())),
        }
    }

    /// Most recent measured value, updated whatever the sink.
    pub fn measure_instantaneous(&self) -> f32 {
        self.latest
    }

    pub fn measure_none(&mut self) {
        self.sink = Sink::None;
    }

    /// Collect up to `capacity` measured samples; later ones are dropped
    /// until the caller drains the returned buffer.
    pub fn measure_buffer(&mut self, capacity: usize) -> MeasureBuffer {
        let buffer = MeasureBuffer::new(capacity);
        self.sink = Sink::Buffer(buffer.clone());
        buffer
    }

    pub fn measure_callback<F>(&mut self, f: F)
    where
        F: FnMut(f32) + Send + 'static,
    {
        self.sink = Sink::Callback(Box::new(f));
    }

    /// Produce the value for the next outgoing slot.
    pub fn get_sample(&mut self) -> f32 {
        match &mut self.source {
            Source::Constant(v) => *v,
            Source::Periodic(p) => p.next(),
            Source::Buffer {
                data,
                cursor,
                repeat,
            } => {
                if *cursor >= data.len() {
                    if *repeat {
                        *cursor = 0;
                    } else {
                        return data[data.len() - 1];
                    }
                }
                let v = data[*cursor];
                *cursor += 1;
                v
            }
            Source::Callback { f, index } => {
                let v = f(*index);
                *index += 1;
                v
            }
        }
    }

    /// Accept the value of the next incoming slot.
    pub fn put_sample(&mut self, value: f32) {
        self.latest = value;
        match &mut self.sink {
            Sink::None => {}
            Sink::Buffer(b) => b.push(value),
            Sink::Callback(f) => f(value),
        }
    }
}
