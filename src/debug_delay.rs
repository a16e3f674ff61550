/// Induces random jitter at the crate's racy shoulders
/// (guard acquisition, hold-node swap, index and buffer
/// publication) under the `runtime_verification` feature,
/// shaking out more interleavings of the reader/writer
/// protocol quickly. Compiles to nothing otherwise.
///
/// Mostly yields, so reads and generation changes interleave
/// densely; occasionally sleeps long enough to strand a
/// reader between loading the hold-node pointer and
/// incrementing its refcount, the window the validate/back
/// off loop in `take_guard` exists for.
pub fn debug_delay() {
    #[cfg(feature = "runtime_verification")]
    {
        use std::thread;
        use std::time::Duration;

        use rand::{thread_rng, Rng};

        let mut rng = thread_rng();

        match rng.gen_range(0..1000) {
            0..=949 => thread::yield_now(),
            950..=997 => thread::sleep(Duration::from_micros(rng.gen_range(1..100))),
            _ => thread::sleep(Duration::from_millis(2)),
        }
    }
}
