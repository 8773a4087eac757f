//! Small, shared DSP and timing helpers.

pub mod buffer;
pub mod lfo;
pub mod smoothed;
pub mod time;

// -------------------------------------------------------------------------------------------------

/// Balance law gain factors for the given panning position in range `-1.0..=1.0`.
///
/// Center panning leaves both channels untouched, so panning a mono signal which got copied
/// into both channels never changes its level at the center position.
#[inline]
pub fn panning_factors(panning: f32) -> (f32, f32) {
    debug_assert!((-1.0..=1.0).contains(&panning), "Invalid panning value");
    let left = (1.0 - panning).min(1.0);
    let right = (1.0 + panning).min(1.0);
    (left, right)
}

/// Convert a pitch offset in semitones to a playback speed factor.
#[inline]
pub fn pitch_to_speed(semitones: f32) -> f64 {
    2.0_f64.powf(semitones as f64 / 12.0)
}

// -------------------------------------------------------------------------------------------------

/// Run the given function with allocation checks, when the `assert-allocs` feature is enabled.
#[inline]
pub(crate) fn assert_no_alloc<T, F: FnOnce() -> T>(func: F) -> T {
    #[cfg(feature = "assert-allocs")]
    return assert_no_alloc::assert_no_alloc::<T, F>(func);

    #[cfg(not(feature = "assert-allocs"))]
    return func();
}

/// Temporarily allow allocations within an [`assert_no_alloc`] scope.
#[inline]
pub(crate) fn permit_alloc<T, F: FnOnce() -> T>(func: F) -> T {
    #[cfg(feature = "assert-allocs")]
    return assert_no_alloc::permit_alloc::<T, F>(func);

    #[cfg(not(feature = "assert-allocs"))]
    return func();
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panning() {
        assert_eq!(panning_factors(0.0), (1.0, 1.0));
        assert_eq!(panning_factors(-1.0), (1.0, 0.0));
        assert_eq!(panning_factors(1.0), (0.0, 1.0));
        let (l, r) = panning_factors(0.5);
        assert!((l - 0.5).abs() < f32::EPSILON && r == 1.0);
    }

    #[test]
    fn pitch_speed() {
        assert_eq!(pitch_to_speed(0.0), 1.0);
        assert!((pitch_to_speed(12.0) - 2.0).abs() < 1e-12);
        assert!((pitch_to_speed(-12.0) - 0.5).abs() < 1e-12);
        assert!((pitch_to_speed(7.0) - 1.4983070768766815).abs() < 1e-9);
    }
}
