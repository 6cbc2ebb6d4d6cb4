//! Vector kernels with runtime CPU dispatch.
//!
//! [`ops`] returns the best implementation for the running CPU. The choice
//! is made once, on first use, and never changes afterwards.

use std::sync::OnceLock;

use rustfft::num_complex::Complex;

/// Kernels used by the mixing and convolution paths. Slices passed together
/// must have equal lengths; extra elements of the longer slice are ignored.
pub trait VectorOps: Send + Sync {
    fn name(&self) -> &'static str;

    /// `out[i] += input[i]`
    fn add(&self, out: &mut [f32], input: &[f32]);

    /// `out[i] += input[i] * k`
    fn mul_add(&self, out: &mut [f32], input: &[f32], k: f32);

    /// `out[i] *= k`
    fn scale(&self, out: &mut [f32], k: f32);

    /// Dot product.
    fn mul_reduce(&self, a: &[f32], b: &[f32]) -> f32;

    /// `out[i] += a[i] * b[i]` over complex numbers.
    fn complex_mul_acc(&self, out: &mut [Complex<f32>], a: &[Complex<f32>], b: &[Complex<f32>]);
}

/// Portable implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Scalar;

impl VectorOps for Scalar {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn add(&self, out: &mut [f32], input: &[f32]) {
        for (o, &x) in out.iter_mut().zip(input) {
            *o += x;
        }
    }

    fn mul_add(&self, out: &mut [f32], input: &[f32], k: f32) {
        for (o, &x) in out.iter_mut().zip(input) {
            *o += x * k;
        }
    }

    fn scale(&self, out: &mut [f32], k: f32) {
        for o in out.iter_mut() {
            *o *= k;
        }
    }

    fn mul_reduce(&self, a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(&x, &y)| x * y).sum()
    }

    fn complex_mul_acc(&self, out: &mut [Complex<f32>], a: &[Complex<f32>], b: &[Complex<f32>]) {
        for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
            *o += x * y;
        }
    }
}

static SCALAR: Scalar = Scalar;
static SELECTED: OnceLock<&'static dyn VectorOps> = OnceLock::new();

/// The portable kernels, regardless of CPU.
pub fn scalar() -> &'static dyn VectorOps {
    &SCALAR
}

/// The fastest kernels supported by this CPU.
pub fn ops() -> &'static dyn VectorOps {
    *SELECTED.get_or_init(detect)
}

fn detect() -> &'static dyn VectorOps {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(avx) = avx2::Avx2::detect() {
            log::debug!("vector kernels: {}", avx.name());
            return avx;
        }
    }
    log::debug!("vector kernels: {}", SCALAR.name());
    &SCALAR
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    use rustfft::num_complex::Complex;

    use super::{Scalar, VectorOps};

    /// AVX2 + FMA kernels. Only obtainable through [`Avx2::detect`].
    #[derive(Debug)]
    pub struct Avx2 {
        _private: (),
    }

    static AVX2: Avx2 = Avx2 { _private: () };

    impl Avx2 {
        pub fn detect() -> Option<&'static Avx2> {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                Some(&AVX2)
            } else {
                None
            }
        }
    }

    // SAFETY for every call below: an `Avx2` value only exists after
    // `detect` confirmed both features at runtime.
    impl VectorOps for Avx2 {
        fn name(&self) -> &'static str {
            "avx2"
        }

        fn add(&self, out: &mut [f32], input: &[f32]) {
            unsafe { add(out, input) }
        }

        fn mul_add(&self, out: &mut [f32], input: &[f32], k: f32) {
            unsafe { mul_add(out, input, k) }
        }

        fn scale(&self, out: &mut [f32], k: f32) {
            unsafe { scale(out, k) }
        }

        fn mul_reduce(&self, a: &[f32], b: &[f32]) -> f32 {
            unsafe { mul_reduce(a, b) }
        }

        fn complex_mul_acc(&self, out: &mut [Complex<f32>], a: &[Complex<f32>], b: &[Complex<f32>]) {
            unsafe { complex_mul_acc(out, a, b) }
        }
    }

    const LANES: usize = 8;

    #[target_feature(enable = "avx2,fma")]
    unsafe fn add(out: &mut [f32], input: &[f32]) {
        let n = out.len().min(input.len());
        let body = n - n % LANES;
        let mut i = 0;
        while i < body {
            unsafe {
                let o = _mm256_loadu_ps(out.as_ptr().add(i));
                let x = _mm256_loadu_ps(input.as_ptr().add(i));
                _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_add_ps(o, x));
            }
            i += LANES;
        }
        Scalar.add(&mut out[body..n], &input[body..n]);
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn mul_add(out: &mut [f32], input: &[f32], k: f32) {
        let n = out.len().min(input.len());
        let body = n - n % LANES;
        let kv = _mm256_set1_ps(k);
        let mut i = 0;
        while i < body {
            unsafe {
                let o = _mm256_loadu_ps(out.as_ptr().add(i));
                let x = _mm256_loadu_ps(input.as_ptr().add(i));
                _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_fmadd_ps(x, kv, o));
            }
            i += LANES;
        }
        Scalar.mul_add(&mut out[body..n], &input[body..n], k);
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn scale(out: &mut [f32], k: f32) {
        let n = out.len();
        let body = n - n % LANES;
        let kv = _mm256_set1_ps(k);
        let mut i = 0;
        while i < body {
            unsafe {
                let o = _mm256_loadu_ps(out.as_ptr().add(i));
                _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_mul_ps(o, kv));
            }
            i += LANES;
        }
        Scalar.scale(&mut out[body..n], k);
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn mul_reduce(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let body = n - n % LANES;
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < body {
            unsafe {
                let x = _mm256_loadu_ps(a.as_ptr().add(i));
                let y = _mm256_loadu_ps(b.as_ptr().add(i));
                acc = _mm256_fmadd_ps(x, y, acc);
            }
            i += LANES;
        }
        let mut lanes = [0.0_f32; LANES];
        unsafe { _mm256_storeu_ps(lanes.as_mut_ptr(), acc) };
        lanes.iter().sum::<f32>() + Scalar.mul_reduce(&a[body..n], &b[body..n])
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn complex_mul_acc(out: &mut [Complex<f32>], a: &[Complex<f32>], b: &[Complex<f32>]) {
        // Four interleaved (re, im) pairs per register.
        const PAIRS: usize = 4;
        let n = out.len().min(a.len()).min(b.len());
        let body = n - n % PAIRS;
        let po = out.as_mut_ptr() as *mut f32;
        let pa = a.as_ptr() as *const f32;
        let pb = b.as_ptr() as *const f32;
        let mut i = 0;
        while i < body {
            unsafe {
                let x = _mm256_loadu_ps(pa.add(2 * i));
                let y = _mm256_loadu_ps(pb.add(2 * i));
                let o = _mm256_loadu_ps(po.add(2 * i));
                let y_re = _mm256_moveldup_ps(y);
                let y_im = _mm256_movehdup_ps(y);
                let x_swap = _mm256_permute_ps::<0b1011_0001>(x);
                let t1 = _mm256_mul_ps(x, y_re);
                let t2 = _mm256_mul_ps(x_swap, y_im);
                let prod = _mm256_addsub_ps(t1, t2);
                _mm256_storeu_ps(po.add(2 * i), _mm256_add_ps(o, prod));
            }
            i += PAIRS;
        }
        Scalar.complex_mul_acc(&mut out[body..n], &a[body..n], &b[body..n]);
    }
}
