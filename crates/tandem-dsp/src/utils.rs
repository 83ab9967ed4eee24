/// Magnitudes below this are flushed to exact zero in recursive state.
pub const DENORMAL_THRESHOLD: f64 = 1.0e-15;

#[inline]
pub fn snap_denormal(value: f64) -> f64 {
    if value.abs() < DENORMAL_THRESHOLD {
        0.0
    } else {
        value
    }
}

#[cfg(all(feature = "simd", any(target_arch = "x86", target_arch = "x86_64")))]
const DAZ_FTZ: u32 = 0x8040;

/// Enables flush-to-zero and denormals-are-zero for the calling thread.
#[inline]
pub fn flush_denormals() {
    #[cfg(all(feature = "simd", any(target_arch = "x86", target_arch = "x86_64")))]
    write_csr(read_csr() | DAZ_FTZ);
}

/// Keeps FTZ/DAZ on for the calling thread while alive and restores the
/// previous MXCSR on drop. Without the `no-denormals` feature it does
/// nothing and `snap_denormal` alone keeps recursive state clean.
#[cfg(feature = "no-denormals")]
#[derive(Debug)]
pub struct NoDenormalsGuard {
    #[cfg(all(feature = "simd", any(target_arch = "x86", target_arch = "x86_64")))]
    prev: u32,
}

#[cfg(feature = "no-denormals")]
impl NoDenormalsGuard {
    #[inline]
    pub fn new() -> Self {
        #[cfg(all(feature = "simd", any(target_arch = "x86", target_arch = "x86_64")))]
        {
            let prev = read_csr();
            write_csr(prev | DAZ_FTZ);
            Self { prev }
        }
        #[cfg(not(all(feature = "simd", any(target_arch = "x86", target_arch = "x86_64"))))]
        {
            Self {}
        }
    }
}

#[cfg(feature = "no-denormals")]
impl Drop for NoDenormalsGuard {
    fn drop(&mut self) {
        #[cfg(all(feature = "simd", any(target_arch = "x86", target_arch = "x86_64")))]
        write_csr(self.prev);
    }
}

#[cfg(not(feature = "no-denormals"))]
#[derive(Clone, Copy, Debug)]
pub struct NoDenormalsGuard;

#[cfg(not(feature = "no-denormals"))]
impl NoDenormalsGuard {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoDenormalsGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(feature = "simd", any(target_arch = "x86", target_arch = "x86_64")))]
#[allow(deprecated)]
#[inline]
fn read_csr() -> u32 {
    #[cfg(target_arch = "x86")]
    use core::arch::x86::_mm_getcsr;
    #[cfg(target_arch = "x86_64")]
    use core::arch::x86_64::_mm_getcsr;
    unsafe { _mm_getcsr() }
}

#[cfg(all(feature = "simd", any(target_arch = "x86", target_arch = "x86_64")))]
#[allow(deprecated)]
#[inline]
fn write_csr(csr: u32) {
    #[cfg(target_arch = "x86")]
    use core::arch::x86::_mm_setcsr;
    #[cfg(target_arch = "x86_64")]
    use core::arch::x86_64::_mm_setcsr;
    unsafe { _mm_setcsr(csr) }
}
