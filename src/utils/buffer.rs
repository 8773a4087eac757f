//! Interleaved buffer helpers.

// -------------------------------------------------------------------------------------------------

/// Set all samples in the given buffer to zero.
#[inline]
pub fn clear_buffer(buffer: &mut [f32]) {
    buffer.fill(0.0);
}

/// Multiply all samples in the given buffer with a constant factor.
#[inline]
pub fn scale_buffer(buffer: &mut [f32], factor: f32) {
    for s in buffer.iter_mut() {
        *s *= factor;
    }
}

/// Replace non finite samples with silence. Returns true when the buffer contained any.
pub fn sanitize_buffer(buffer: &mut [f32]) -> bool {
    let mut found_non_finite = false;
    for s in buffer.iter_mut() {
        if !s.is_finite() {
            *s = 0.0;
            found_non_finite = true;
        }
    }
    found_non_finite
}

// -------------------------------------------------------------------------------------------------
