//! Blend math shared by live interpolation and replay reconstruction.
//!
//! Both paths must produce the same visual result for the same inputs, so the
//! blend factor and position mix are defined once here.

/// Minimum span between bracketing frames, guards against division by zero.
pub const EPSILON: f64 = 1e-6;

/// Normalized position of `target` between `a_t` and `b_t`, clamped to `[0, 1]`.
pub fn blend_factor(a_t: f64, b_t: f64, target: f64) -> f32 {
    let span = (b_t - a_t).max(EPSILON);
    ((target - a_t) / span).clamp(0.0, 1.0) as f32
}

pub fn lerp(a: f32, b: f32, u: f32) -> f32 {
    (1.0 - u) * a + u * b
}

pub fn lerp_point(a: (f32, f32), b: (f32, f32), u: f32) -> (f32, f32) {
    (lerp(a.0, b.0, u), lerp(a.1, b.1, u))
}
