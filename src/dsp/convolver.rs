//! Stereo convolution reverb.

use std::io::Read;
use std::path::Path;

use rustfft::FftPlanner;

use super::convolve::{BLOCK_LENGTH, CascadeConvolver, ConvolutionJob, HEAD_LENGTH, PartitionedConvolver};
use super::worker::{Worker, WorkerLane};
use crate::consts::SAMPLE_RATE;
use crate::param::AudioParameter;

/// Stereo impulse response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpulseResponse {
    left: Vec<f32>,
    right: Vec<f32>,
    zero_delay: bool,
}

impl ImpulseResponse {
    /// Both channels are padded to the same length.
    pub fn new(mut left: Vec<f32>, mut right: Vec<f32>) -> Self {
        let len = left.len().max(right.len());
        left.resize(len, 0.0);
        right.resize(len, 0.0);
        Self {
            left,
            right,
            zero_delay: true,
        }
    }

    pub fn mono(samples: Vec<f32>) -> Self {
        Self::new(samples.clone(), samples)
    }

    /// Read a mono or stereo WAV file. Extra channels are ignored.
    pub fn from_wav_reader<R: Read>(reader: R) -> Result<Self, hound::Error> {
        let mut wav = hound::WavReader::new(reader)?;
        let spec = wav.spec();
        if spec.sample_rate != SAMPLE_RATE {
            log::warn!(
                "impulse response sampled at {} Hz, engine runs at {} Hz",
                spec.sample_rate,
                SAMPLE_RATE
            );
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => wav.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                wav.samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<_, _>>()?
            }
        };

        let channels = spec.channels.max(1) as usize;
        let left: Vec<f32> = interleaved.iter().step_by(channels).copied().collect();
        let right: Vec<f32> = if channels > 1 {
            interleaved.iter().skip(1).step_by(channels).copied().collect()
        } else {
            left.clone()
        };
        Ok(Self::new(left, right))
    }

    pub fn from_wav_file(path: impl AsRef<Path>) -> Result<Self, hound::Error> {
        let file = std::fs::File::open(path)?;
        Self::from_wav_reader(std::io::BufReader::new(file))
    }

    /// When set, the first block is convolved directly so the reverb adds
    /// no latency.
    pub fn with_zero_delay(mut self, zero_delay: bool) -> Self {
        self.zero_delay = zero_delay;
        self
    }

    pub fn zero_delay(&self) -> bool {
        self.zero_delay
    }

    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn left(&self) -> &[f32] {
        &self.left
    }

    pub fn right(&self) -> &[f32] {
        &self.right
    }

    pub fn scale(&mut self, gain: f32) {
        for s in self.left.iter_mut().chain(self.right.iter_mut()) {
            *s *= gain;
        }
    }
}

struct Channel {
    head: Option<CascadeConvolver>,
    tail: PartitionedConvolver,
}

impl Channel {
    fn new(ir: &[f32], zero_delay: bool, length: usize, planner: &mut FftPlanner<f32>) -> Self {
        let mut padded = ir.to_vec();
        padded.resize(length, 0.0);

        let (head, tail_ir) = if zero_delay {
            (Some(CascadeConvolver::new(&padded, planner)), &padded[HEAD_LENGTH.min(length)..])
        } else {
            (None, &padded[..])
        };

        Self {
            head,
            tail: PartitionedConvolver::new(tail_ir, BLOCK_LENGTH, planner),
        }
    }

    fn reset(&mut self) {
        if let Some(head) = self.head.as_mut() {
            head.reset();
        }
        self.tail.reset();
    }

    #[inline]
    fn tick(&mut self, x: f32) -> f32 {
        let mut y = self.tail.tick(x);
        if let Some(head) = self.head.as_mut() {
            y += head.tick(x);
        }
        y
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Process,
}

/// Stereo convolution reverb with smoothed dry/wet mix.
///
/// The impulse response is transformed when installed, which allocates and
/// must happen off the audio thread. While in real-time mode the ahead-of-time
/// partitions run on a background [`Worker`].
pub struct Convolver {
    dry: AudioParameter,
    wet: AudioParameter,
    state: State,
    left: Option<Channel>,
    right: Option<Channel>,
    length: usize,
    zero_delay: bool,
    non_realtime: bool,
    worker: Option<Worker>,
}

impl Default for Convolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Convolver {
    pub const DEFAULT_DRY: f32 = 0.0;
    pub const DEFAULT_WET: f32 = 1.0;
    pub const BLOCK_SIZE: usize = BLOCK_LENGTH;

    pub fn new() -> Self {
        Self {
            dry: AudioParameter::new(Self::DEFAULT_DRY, 0.0, 1.0, 0.01),
            wet: AudioParameter::new(Self::DEFAULT_WET, 0.0, 1.0, 0.01),
            state: State::Idle,
            left: None,
            right: None,
            length: 0,
            zero_delay: true,
            non_realtime: false,
            worker: None,
        }
    }

    /// Install a new impulse response. An empty response returns the
    /// convolver to pass-through.
    pub fn set_impulse_response(&mut self, ir: &ImpulseResponse) {
        self.release_worker();

        if ir.is_empty() {
            self.left = None;
            self.right = None;
            self.length = 0;
            self.state = State::Idle;
            return;
        }

        self.zero_delay = ir.zero_delay();
        self.length = ir.len().div_ceil(BLOCK_LENGTH).max(1) * BLOCK_LENGTH;

        let mut planner = FftPlanner::new();
        self.left = Some(Channel::new(ir.left(), self.zero_delay, self.length, &mut planner));
        self.right = Some(Channel::new(ir.right(), self.zero_delay, self.length, &mut planner));

        self.attach_worker();
        self.state = State::Process;

        log::info!(
            "impulse response installed: {} samples, zero delay {}",
            ir.len(),
            self.zero_delay
        );
    }

    pub fn set_dry_wet(&mut self, dry: f32, wet: f32, force: bool) {
        self.dry.set_value(dry, force);
        self.wet.set_value(wet, force);
    }

    pub fn set_wet(&mut self, wet: f32) {
        self.wet.set_value(wet, false);
    }

    pub fn wet(&self) -> f32 {
        self.wet.target()
    }

    pub fn dry(&self) -> f32 {
        self.dry.target()
    }

    pub fn is_audible(&self) -> bool {
        self.wet.target() > 0.0 || self.wet.value() > 0.0
    }

    pub fn has_impulse_response(&self) -> bool {
        self.state == State::Process
    }

    /// Impulse response length rounded up to whole blocks; also the number
    /// of samples the reverb tail may ring after the input falls silent.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn zero_delay(&self) -> bool {
        self.zero_delay
    }

    pub fn is_non_realtime(&self) -> bool {
        self.non_realtime
    }

    /// In non-realtime mode every partition is computed inline so offline
    /// renders never drop a block.
    pub fn set_non_realtime(&mut self, non_realtime: bool) {
        if self.non_realtime == non_realtime {
            return;
        }
        self.non_realtime = non_realtime;
        self.release_worker();
        self.attach_worker();
    }

    pub fn reset(&mut self) {
        for ch in [self.left.as_mut(), self.right.as_mut()].into_iter().flatten() {
            ch.reset();
        }
    }

    /// Process `in_*` into `out_*`. All four slices must have the same
    /// length; the shortest one bounds the frames processed.
    pub fn process(&mut self, in_l: &[f32], in_r: &[f32], out_l: &mut [f32], out_r: &mut [f32]) {
        let n = in_l.len().min(in_r.len()).min(out_l.len()).min(out_r.len());

        match (self.state, self.left.as_mut(), self.right.as_mut()) {
            (State::Process, Some(left), Some(right)) => {
                for i in 0..n {
                    let l = left.tick(in_l[i]);
                    let r = right.tick(in_r[i]);
                    let dry = self.dry.next_value();
                    let wet = self.wet.next_value();
                    out_l[i] = l * wet + in_l[i] * dry;
                    out_r[i] = r * wet + in_r[i] * dry;
                }
            }
            _ => {
                for i in 0..n {
                    let dry = self.dry.next_value();
                    self.wet.next_value();
                    out_l[i] = in_l[i] * dry;
                    out_r[i] = in_r[i] * dry;
                }
            }
        }
    }

    /// Same as [`process`](Self::process) but in place.
    pub fn process_in_place(&mut self, left: &mut [f32], right: &mut [f32]) {
        let n = left.len().min(right.len());

        match (self.state, self.left.as_mut(), self.right.as_mut()) {
            (State::Process, Some(cl), Some(cr)) => {
                for i in 0..n {
                    let l = cl.tick(left[i]);
                    let r = cr.tick(right[i]);
                    let dry = self.dry.next_value();
                    let wet = self.wet.next_value();
                    left[i] = l * wet + left[i] * dry;
                    right[i] = r * wet + right[i] * dry;
                }
            }
            _ => {
                for i in 0..n {
                    let dry = self.dry.next_value();
                    self.wet.next_value();
                    left[i] *= dry;
                    right[i] *= dry;
                }
            }
        }
    }

    fn attach_worker(&mut self) {
        if self.non_realtime || self.left.is_none() {
            return;
        }
        // Every partition may have a job in flight at once.
        let capacity = [self.left.as_ref(), self.right.as_ref()]
            .into_iter()
            .flatten()
            .map(|ch| ch.tail.partition_count())
            .max()
            .unwrap_or(1);
        match Worker::spawn::<ConvolutionJob>(2, capacity) {
            Ok((worker, lanes)) => {
                let mut lanes = lanes.into_iter();
                self.set_lanes(lanes.next(), lanes.next());
                self.worker = Some(worker);
            }
            Err(e) => {
                log::warn!("convolution worker unavailable, computing inline: {e}");
            }
        }
    }

    fn release_worker(&mut self) {
        self.set_lanes(None, None);
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }

    fn set_lanes(&mut self, l: Option<WorkerLane<ConvolutionJob>>, r: Option<WorkerLane<ConvolutionJob>>) {
        if let Some(ch) = self.left.as_mut() {
            ch.tail.set_lane(l);
        }
        if let Some(ch) = self.right.as_mut() {
            ch.tail.set_lane(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(conv: &mut Convolver, input: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let mut l = vec![0.0; input.len()];
        let mut r = vec![0.0; input.len()];
        for (chunk, (ol, or)) in input
            .chunks(64)
            .zip(l.chunks_mut(64).zip(r.chunks_mut(64)))
        {
            conv.process(chunk, chunk, ol, or);
        }
        (l, r)
    }

    #[test]
    fn without_response_passes_dry_signal() {
        let mut conv = Convolver::new();
        conv.set_dry_wet(1.0, 0.25, true);
        assert!(!conv.has_impulse_response());

        let input: Vec<f32> = (0..256).map(|i| (i as f32 * 0.1).sin()).collect();
        let (l, r) = render(&mut conv, &input);
        assert_eq!(l, input);
        assert_eq!(r, input);
    }

    #[test]
    fn length_is_rounded_to_blocks() {
        let mut conv = Convolver::new();
        conv.set_non_realtime(true);
        conv.set_impulse_response(&ImpulseResponse::mono(vec![0.5; 5000]));
        assert_eq!(conv.length(), 2 * Convolver::BLOCK_SIZE);
        assert!(conv.has_impulse_response());
    }

    #[test]
    fn zero_delay_unit_impulse_is_identity() {
        let mut conv = Convolver::new();
        conv.set_non_realtime(true);
        conv.set_dry_wet(0.0, 1.0, true);
        let mut ir = vec![0.0; 100];
        ir[0] = 1.0;
        conv.set_impulse_response(&ImpulseResponse::new(ir.clone(), ir));

        let input: Vec<f32> = (0..2048).map(|i| ((i * 13) % 29) as f32 / 29.0 - 0.5).collect();
        let (l, r) = render(&mut conv, &input);
        for i in 0..input.len() {
            assert!((l[i] - input[i]).abs() < 1e-4, "left {i}: {} vs {}", l[i], input[i]);
            assert!((r[i] - input[i]).abs() < 1e-4, "right {i}: {} vs {}", r[i], input[i]);
        }
    }

    #[test]
    fn delayed_response_reaches_the_tail() {
        let mut conv = Convolver::new();
        conv.set_non_realtime(true);
        conv.set_dry_wet(0.0, 1.0, true);
        let delay = HEAD_LENGTH + 100;
        let mut ir = vec![0.0; delay + 1];
        ir[delay] = 0.5;
        conv.set_impulse_response(&ImpulseResponse::mono(ir));

        let mut input = vec![0.0; 3 * BLOCK_LENGTH];
        input[10] = 1.0;
        let (l, _) = render(&mut conv, &input);
        let peak = l
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| i);
        assert_eq!(peak, Some(10 + delay));
        assert!((l[10 + delay] - 0.5).abs() < 1e-4, "got {}", l[10 + delay]);
    }

    #[test]
    fn worker_lanes_hold_every_partition() {
        let mut conv = Convolver::new();
        let ir = ImpulseResponse::mono(vec![0.01; 40 * BLOCK_LENGTH]);
        conv.set_impulse_response(&ir);
        let Some(ch) = conv.left.as_mut() else {
            panic!("no left channel");
        };
        let partitions = ch.tail.partition_count();
        assert!(partitions > 16);
        let lane = ch.tail.set_lane(None).expect("worker lane attached");
        assert_eq!(lane.capacity(), partitions);
    }

    #[test]
    fn audible_tracks_wet_level() {
        let mut conv = Convolver::new();
        conv.set_dry_wet(1.0, 0.0, true);
        assert!(!conv.is_audible());
        conv.set_wet(0.3);
        assert!(conv.is_audible());
    }

    #[test]
    fn reads_stereo_wav() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("writer");
            for (l, r) in [(16384_i16, -16384_i16), (0, 8192)] {
                writer.write_sample(l).expect("write");
                writer.write_sample(r).expect("write");
            }
            writer.finalize().expect("finalize");
        }
        cursor.set_position(0);

        let ir = ImpulseResponse::from_wav_reader(cursor).expect("read");
        assert_eq!(ir.len(), 2);
        assert_eq!(ir.left(), &[0.5, 0.0]);
        assert_eq!(ir.right(), &[-0.5, 0.25]);
        assert!(ir.zero_delay());
    }
}
