//! Convolution building blocks.
//!
//! * [`FirSegment`]: direct-form convolution with the first few taps.
//! * [`FftSegment`]: one FFT overlap-add stage whose latency equals its
//!   length, so it handles the taps starting at that offset.
//! * [`CascadeConvolver`]: FIR plus FFT stages of doubling size; together
//!   they convolve the first [`HEAD_LENGTH`] taps with no latency.
//! * [`PartitionedConvolver`]: equally partitioned frequency-domain
//!   convolution for the remainder, with all but the newest partition
//!   computed ahead of time on a [`Worker`](super::worker::Worker).

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::simd;
use super::worker::{Job, WorkerLane};

/// Number of direct-form taps in the cascade head.
pub const FIR_LENGTH: usize = 32;
/// Largest FFT stage of the cascade head.
pub const HEAD_MAX_SEGMENT: usize = 2048;
/// Taps covered by the cascade head, and the tail partition size.
pub const HEAD_LENGTH: usize = 4096;
pub const BLOCK_LENGTH: usize = HEAD_LENGTH;

const ZERO: Complex<f32> = Complex { re: 0.0, im: 0.0 };

fn padded_spectrum(ir: &[f32], len: usize, fft: &dyn Fft<f32>) -> Arc<[Complex<f32>]> {
    let mut buf = vec![ZERO; 2 * len];
    for (b, &h) in buf.iter_mut().zip(ir.iter().take(len)) {
        b.re = h;
    }
    fft.process(&mut buf);
    buf.into()
}

// ── FIR ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FirSegment {
    taps: Vec<f32>,
    /// Input history stored twice so the newest `len` samples are always
    /// one contiguous slice, newest first.
    history: Vec<f32>,
    pos: usize,
}

impl FirSegment {
    pub fn new(ir: &[f32], len: usize) -> Self {
        let mut taps = vec![0.0; len];
        for (t, &h) in taps.iter_mut().zip(ir) {
            *t = h;
        }
        Self {
            taps,
            history: vec![0.0; 2 * len],
            pos: 0,
        }
    }

    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.pos = 0;
    }

    #[inline]
    pub fn tick(&mut self, x: f32) -> f32 {
        let len = self.taps.len();
        self.pos = if self.pos == 0 { len - 1 } else { self.pos - 1 };
        self.history[self.pos] = x;
        self.history[self.pos + len] = x;
        simd::ops().mul_reduce(&self.taps, &self.history[self.pos..self.pos + len])
    }
}

// ── FFT stage ───────────────────────────────────────────────

/// Uniform overlap-add convolution with a single `len`-tap partition.
///
/// Output lags input by exactly `len` samples.
pub struct FftSegment {
    len: usize,
    ir: Arc<[Complex<f32>]>,
    /// Lower half collects input, then holds the finished output block.
    buffer: Vec<Complex<f32>>,
    product: Vec<Complex<f32>>,
    tail: Vec<f32>,
    pos: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl FftSegment {
    pub fn new(ir: &[f32], len: usize, planner: &mut FftPlanner<f32>) -> Self {
        let fft = planner.plan_fft_forward(2 * len);
        let ifft = planner.plan_fft_inverse(2 * len);
        let scratch_len = fft.get_inplace_scratch_len().max(ifft.get_inplace_scratch_len());
        Self {
            len,
            ir: padded_spectrum(ir, len, fft.as_ref()),
            buffer: vec![ZERO; 2 * len],
            product: vec![ZERO; 2 * len],
            tail: vec![0.0; len],
            pos: 0,
            fft,
            ifft,
            scratch: vec![ZERO; scratch_len],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn reset(&mut self) {
        self.buffer.fill(ZERO);
        self.tail.fill(0.0);
        self.pos = 0;
    }

    #[inline]
    pub fn tick(&mut self, x: f32) -> f32 {
        let y = self.buffer[self.pos].re;
        self.buffer[self.pos] = Complex::new(x, 0.0);
        self.pos += 1;
        if self.pos == self.len {
            self.pos = 0;
            self.convolve();
        }
        y
    }

    fn convolve(&mut self) {
        let len = self.len;
        self.buffer[len..].fill(ZERO);
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        self.product.fill(ZERO);
        simd::ops().complex_mul_acc(&mut self.product, &self.buffer, &self.ir);
        self.ifft.process_with_scratch(&mut self.product, &mut self.scratch);

        let norm = 1.0 / (2 * len) as f32;
        for i in 0..len {
            let y = norm * self.product[i].re + self.tail[i];
            self.tail[i] = norm * self.product[len + i].re;
            self.buffer[i] = Complex::new(y, 0.0);
        }
    }
}

// ── Zero-latency head ───────────────────────────────────────

/// Convolves the first [`HEAD_LENGTH`] taps of an impulse response with no
/// added latency.
pub struct CascadeConvolver {
    fir: FirSegment,
    segments: Vec<FftSegment>,
}

impl CascadeConvolver {
    pub fn new(ir: &[f32], planner: &mut FftPlanner<f32>) -> Self {
        let fir = FirSegment::new(ir, FIR_LENGTH);

        let mut segments = Vec::new();
        let mut offset = FIR_LENGTH;
        let mut len = FIR_LENGTH;
        while len <= HEAD_MAX_SEGMENT {
            let part = if offset < ir.len() { &ir[offset..] } else { &[][..] };
            segments.push(FftSegment::new(part, len, planner));
            offset += len;
            len *= 2;
        }
        debug_assert_eq!(offset, HEAD_LENGTH);

        Self { fir, segments }
    }

    pub fn reset(&mut self) {
        self.fir.reset();
        for s in self.segments.iter_mut() {
            s.reset();
        }
    }

    #[inline]
    pub fn tick(&mut self, x: f32) -> f32 {
        let mut y = self.fir.tick(x);
        for s in self.segments.iter_mut() {
            y += s.tick(x);
        }
        y
    }
}

// ── Partitioned tail ────────────────────────────────────────

/// One partition's frequency-domain multiply and inverse transform.
pub struct ConvolutionJob {
    block: usize,
    epoch: u64,
    spectrum: Box<[Complex<f32>]>,
    product: Box<[Complex<f32>]>,
    scratch: Box<[Complex<f32>]>,
    ir: Arc<[Complex<f32>]>,
    ifft: Arc<dyn Fft<f32>>,
}

impl Job for ConvolutionJob {
    fn run(&mut self) {
        self.product.fill(ZERO);
        simd::ops().complex_mul_acc(&mut self.product, &self.spectrum, &self.ir);
        self.ifft.process_with_scratch(&mut self.product, &mut self.scratch);
    }
}

struct Partition {
    ir: Arc<[Complex<f32>]>,
    output: Vec<f32>,
    tail: Vec<f32>,
    /// Owned job buffers; `None` while the job is with the worker.
    job: Option<Box<ConvolutionJob>>,
    /// The job holds a product for the upcoming block boundary.
    ready: bool,
    /// Partition has run synchronously once and may now compute ahead.
    dephase: bool,
    preconvolve_index: usize,
}

/// Uniformly partitioned convolution with `len`-sample blocks.
///
/// Output lags input by `len` samples. Partition 0 always works on the
/// newest input spectrum and runs synchronously at each block boundary.
/// Partition `j > 0` only needs spectra that are already known, so its
/// product is computed during the preceding block (staggered across
/// partitions) and merely overlap-added at the boundary. When a worker lane
/// is attached that computation runs on the worker; a product that is not
/// back in time is skipped rather than waited for.
pub struct PartitionedConvolver {
    len: usize,
    fft: Arc<dyn Fft<f32>>,
    input: Vec<Complex<f32>>,
    input_index: usize,
    scratch: Vec<Complex<f32>>,
    /// Frequency-domain delay line of past input spectra.
    spectra: Vec<Box<[Complex<f32>]>>,
    newest: usize,
    partitions: Vec<Partition>,
    ifft: Arc<dyn Fft<f32>>,
    scratch_len: usize,
    lane: Option<WorkerLane<ConvolutionJob>>,
    epoch: u64,
}

impl PartitionedConvolver {
    /// Build a convolver for `ir`, split into `len`-sample partitions.
    pub fn new(ir: &[f32], len: usize, planner: &mut FftPlanner<f32>) -> Self {
        let n = ir.len().div_ceil(len).max(1);
        let fft = planner.plan_fft_forward(2 * len);
        let ifft = planner.plan_fft_inverse(2 * len);
        let scratch_len = fft.get_inplace_scratch_len().max(ifft.get_inplace_scratch_len());

        let partitions = (0..n)
            .map(|j| {
                let start = (j * len).min(ir.len());
                Partition {
                    ir: padded_spectrum(&ir[start..], len, fft.as_ref()),
                    output: vec![0.0; len],
                    tail: vec![0.0; len],
                    job: None,
                    ready: false,
                    dephase: false,
                    preconvolve_index: (j * len / n).clamp(1, len - 1),
                }
            })
            .collect();

        let mut conv = Self {
            len,
            fft,
            input: vec![ZERO; 2 * len],
            input_index: 0,
            scratch: vec![ZERO; scratch_len],
            spectra: (0..n).map(|_| vec![ZERO; 2 * len].into_boxed_slice()).collect(),
            newest: 0,
            partitions,
            ifft,
            scratch_len,
            lane: None,
            epoch: 0,
        };
        conv.replace_missing_jobs();
        conv
    }

    pub fn block_len(&self) -> usize {
        self.len
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Offload ahead-of-time partitions to a worker, or compute everything
    /// inline when `lane` is `None`. Returns the previous lane.
    ///
    /// Jobs still in flight on the previous lane are abandoned and replaced,
    /// so this allocates and must not be called from the audio thread.
    pub fn set_lane(&mut self, lane: Option<WorkerLane<ConvolutionJob>>) -> Option<WorkerLane<ConvolutionJob>> {
        self.reclaim_jobs(self.epoch);
        let previous = std::mem::replace(&mut self.lane, lane);
        self.replace_missing_jobs();
        self.reset();
        previous
    }

    fn replace_missing_jobs(&mut self) {
        let len = self.len;
        for (j, p) in self.partitions.iter_mut().enumerate() {
            if p.job.is_none() {
                p.job = Some(Box::new(ConvolutionJob {
                    block: j,
                    epoch: 0,
                    spectrum: vec![ZERO; 2 * len].into_boxed_slice(),
                    product: vec![ZERO; 2 * len].into_boxed_slice(),
                    scratch: vec![ZERO; self.scratch_len].into_boxed_slice(),
                    ir: Arc::clone(&p.ir),
                    ifft: Arc::clone(&self.ifft),
                }));
            }
        }
    }

    pub fn reset(&mut self) {
        self.input.fill(ZERO);
        self.input_index = 0;
        for s in self.spectra.iter_mut() {
            s.fill(ZERO);
        }
        self.newest = 0;
        self.epoch += 1;
        for p in self.partitions.iter_mut() {
            p.output.fill(0.0);
            p.tail.fill(0.0);
            p.ready = false;
            p.dephase = false;
        }
    }

    #[inline]
    pub fn tick(&mut self, x: f32) -> f32 {
        let i = self.input_index;
        let mut y = 0.0;
        for j in 0..self.partitions.len() {
            y += self.partitions[j].output[i];
            if self.partitions[j].dephase && i + 1 == self.partitions[j].preconvolve_index {
                self.preconvolve(j);
            }
        }

        self.input[i] = Complex::new(x, 0.0);
        self.input_index += 1;
        if self.input_index == self.len {
            self.input_index = 0;
            self.block_boundary();
        }
        y
    }

    fn spectrum_age(&self, age: usize) -> usize {
        let n = self.spectra.len();
        (self.newest + n - age % n) % n
    }

    fn block_boundary(&mut self) {
        let len = self.len;
        let n = self.spectra.len();

        self.newest = (self.newest + 1) % n;
        let slot = &mut self.spectra[self.newest];
        slot.copy_from_slice(&self.input);
        slot[len..].fill(ZERO);
        self.fft.process_with_scratch(slot, &mut self.scratch);

        self.epoch += 1;
        self.reclaim_jobs(self.epoch);

        for j in 0..self.partitions.len() {
            if self.partitions[j].dephase {
                if self.partitions[j].ready {
                    self.overlap_add(j);
                } else {
                    self.skip_block(j);
                }
            } else if self.partitions[j].job.is_some() {
                let age = self.spectrum_age(j);
                if let Some(job) = self.partitions[j].job.as_mut() {
                    job.spectrum.copy_from_slice(&self.spectra[age]);
                    job.run();
                }
                self.overlap_add(j);
                self.partitions[j].dephase = j > 0;
            }
        }
    }

    /// Start the product partition `j` needs at the next boundary.
    fn preconvolve(&mut self, j: usize) {
        let age = self.spectrum_age(j - 1);
        let epoch = self.epoch + 1;
        // Free result slots as the block goes so the lane never has to hold
        // more than the jobs actually in flight.
        self.reclaim_jobs(epoch);
        let Some(mut job) = self.partitions[j].job.take() else {
            return;
        };
        job.spectrum.copy_from_slice(&self.spectra[age]);
        job.epoch = epoch;

        match self.lane.as_mut() {
            Some(lane) => {
                if let Err(mut job) = lane.submit(job) {
                    job.run();
                    self.partitions[j].job = Some(job);
                    self.partitions[j].ready = true;
                }
            }
            None => {
                job.run();
                self.partitions[j].job = Some(job);
                self.partitions[j].ready = true;
            }
        }
    }

    /// Take back finished jobs; products computed for `epoch` become ready.
    fn reclaim_jobs(&mut self, epoch: u64) {
        let Some(lane) = self.lane.as_mut() else {
            return;
        };
        while let Some(job) = lane.collect() {
            let p = &mut self.partitions[job.block];
            p.ready = job.epoch == epoch;
            p.job = Some(job);
        }
    }

    /// Partition `j` has no product for this block: emit the overlap held
    /// from its last product and drop the overlap of the missing one.
    fn skip_block(&mut self, j: usize) {
        let p = &mut self.partitions[j];
        p.output.copy_from_slice(&p.tail);
        p.tail.fill(0.0);
    }

    fn overlap_add(&mut self, j: usize) {
        let len = self.len;
        let norm = 1.0 / (2 * len) as f32;
        let p = &mut self.partitions[j];
        let Some(job) = p.job.as_ref() else {
            return;
        };
        for i in 0..len {
            p.output[i] = norm * job.product[i].re + p.tail[i];
            p.tail[i] = norm * job.product[len + i].re;
        }
        p.ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(input: &[f32], ir: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; input.len()];
        for (n, y) in out.iter_mut().enumerate() {
            for (k, &h) in ir.iter().enumerate() {
                if k <= n {
                    *y += h * input[n - k];
                }
            }
        }
        out
    }

    fn test_signal(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i * 7919) % 97) as f32 / 97.0 - 0.5).collect()
    }

    fn test_ir(n: usize) -> Vec<f32> {
        (0..n).map(|i| (-(i as f32) / 400.0).exp() * ((i as f32) * 0.37).sin()).collect()
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < tol, "sample {i}: {x} vs {y}");
        }
    }

    #[test]
    fn fir_matches_direct_convolution() {
        let ir = test_ir(FIR_LENGTH);
        let input = test_signal(300);
        let mut fir = FirSegment::new(&ir, FIR_LENGTH);
        let out: Vec<f32> = input.iter().map(|&x| fir.tick(x)).collect();
        assert_close(&out, &direct(&input, &ir), 1e-4);
    }

    #[test]
    fn fft_segment_is_delayed_by_its_length() {
        let len = 64;
        let ir = test_ir(len);
        let input = test_signal(1000);
        let mut planner = FftPlanner::new();
        let mut seg = FftSegment::new(&ir, len, &mut planner);
        let out: Vec<f32> = input.iter().map(|&x| seg.tick(x)).collect();

        let expected = direct(&input, &ir);
        assert!(out[..len].iter().all(|&y| y == 0.0));
        assert_close(&out[len..], &expected[..input.len() - len], 1e-4);
    }

    #[test]
    fn cascade_head_has_no_latency() {
        let ir = test_ir(HEAD_LENGTH);
        let input = test_signal(3 * HEAD_LENGTH);
        let mut planner = FftPlanner::new();
        let mut head = CascadeConvolver::new(&ir, &mut planner);
        let out: Vec<f32> = input.iter().map(|&x| head.tick(x)).collect();
        assert_close(&out, &direct(&input, &ir), 5e-3);
    }

    #[test]
    fn partitioned_matches_direct_inline() {
        let len = 64;
        let ir = test_ir(5 * len);
        let input = test_signal(20 * len);
        let mut planner = FftPlanner::new();
        let mut conv = PartitionedConvolver::new(&ir, len, &mut planner);
        assert_eq!(conv.partition_count(), 5);

        let out: Vec<f32> = input.iter().map(|&x| conv.tick(x)).collect();
        let expected = direct(&input, &ir);
        assert_close(&out[len..], &expected[..input.len() - len], 1e-3);
    }

    #[test]
    fn partitioned_with_worker_matches_inline() {
        use crate::dsp::worker::Worker;
        use std::time::Duration;

        let len = 256;
        let ir = test_ir(4 * len);
        let input = test_signal(12 * len);
        let mut planner = FftPlanner::new();

        let mut inline = PartitionedConvolver::new(&ir, len, &mut planner);
        let mut offloaded = PartitionedConvolver::new(&ir, len, &mut planner);
        let (_worker, mut lanes) = Worker::spawn::<ConvolutionJob>(1, 8).expect("spawn failed");
        offloaded.set_lane(lanes.pop());

        for (n, &x) in input.iter().enumerate() {
            let a = inline.tick(x);
            // Give the worker ample time before each boundary.
            if n % len == len - 1 {
                std::thread::sleep(Duration::from_millis(5));
            }
            let b = offloaded.tick(x);
            assert!((a - b).abs() < 1e-4, "sample {n}: {a} vs {b}");
        }
    }

    #[test]
    fn more_partitions_than_lane_slots() {
        use crate::dsp::worker::lane_pair;

        let len = 64;
        let ir = test_ir(10 * len);
        let input = test_signal(16 * len);
        let mut planner = FftPlanner::new();

        let mut inline = PartitionedConvolver::new(&ir, len, &mut planner);
        let mut offloaded = PartitionedConvolver::new(&ir, len, &mut planner);
        let (lane, mut queue) = lane_pair::<ConvolutionJob>(4, std::thread::current());
        offloaded.set_lane(Some(lane));
        assert!(offloaded.partition_count() > 4);

        for (n, &x) in input.iter().enumerate() {
            let a = inline.tick(x);
            let b = offloaded.tick(x);
            queue.run_pending();
            assert!((a - b).abs() < 1e-5, "sample {n}: {a} vs {b}");
        }

        queue.run_pending();
        offloaded.reclaim_jobs(offloaded.epoch);
        assert!(offloaded.partitions.iter().all(|p| p.job.is_some()), "a job went missing");
    }

    #[test]
    fn late_product_keeps_the_overlap_aligned() {
        use crate::dsp::worker::lane_pair;

        let len = 64;
        // The last partition is silent, so only partition 1 matters.
        let mut ir = test_ir(2 * len);
        ir.resize(3 * len, 0.0);
        let mut input = vec![0.0; 8 * len];
        input[40] = 1.0;
        let mut planner = FftPlanner::new();

        let mut inline = PartitionedConvolver::new(&ir, len, &mut planner);
        let mut offloaded = PartitionedConvolver::new(&ir, len, &mut planner);
        let (lane, mut queue) = lane_pair::<ConvolutionJob>(4, std::thread::current());
        offloaded.set_lane(Some(lane));

        let mut reference = Vec::with_capacity(input.len());
        for (n, &x) in input.iter().enumerate() {
            // The worker misses the boundary at the end of block 2, when
            // partition 1 has nothing new to add.
            if n % len == len - 1 && n / len != 2 {
                queue.run_pending();
            }
            let a = inline.tick(x);
            let b = offloaded.tick(x);
            reference.push(a);
            assert!((a - b).abs() < 1e-5, "sample {n}: {a} vs {b}");
        }
        assert!(
            reference[3 * len..4 * len].iter().any(|y| y.abs() > 1e-3),
            "block 3 carries the overlap of partition 1"
        );
    }
}
