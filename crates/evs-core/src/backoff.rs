/// Exponential backoff for attempt `n` (1-based): `base * 2^(n-1)`, capped at `max_ms`.
pub fn exponential_backoff_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << shift).min(max_ms)
}

/// Spread `delay_ms` by up to `±jitter` of itself. `sample` is a uniform draw in [0, 1).
pub fn jittered_ms(delay_ms: u64, jitter: f64, sample: f64) -> u64 {
    let jitter = jitter.clamp(0.0, 1.0);
    let factor = 1.0 + jitter * (2.0 * sample.clamp(0.0, 1.0) - 1.0);
    (delay_ms as f64 * factor).round().max(0.0) as u64
}
