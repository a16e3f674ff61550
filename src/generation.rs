use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{
    atomic::{
        AtomicPtr, AtomicU64,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
    Mutex,
};

use crate::debug_delay;

/// One pinnable epoch. The refcount word holds
/// `2 * guard count + valid bit`; the valid bit is set only
/// while the node is the current one readers may pin.
///
/// Nodes are type-stable: once allocated they are recycled
/// through a free list and only deallocated when the handler
/// itself is dropped, so a reader that increments a stale
/// node's refcount can always safely detect the race and
/// back off.
#[derive(Default)]
struct GenerationHold {
    refs: AtomicU64,
    generation: AtomicU64,
}

struct HoldChain {
    // retired nodes, oldest first, each possibly still
    // pinned by readers
    retired: VecDeque<*mut GenerationHold>,
    free: Vec<*mut GenerationHold>,
}

unsafe impl Send for HoldChain {}

/// Epoch counter plus the reader-pinning protocol.
///
/// The writer advances the current generation after each
/// mutation batch; readers pin whatever generation is
/// current with `take_guard` and never otherwise interact
/// with the handler. Reclamation elsewhere in the crate is
/// gated on `first_used_generation`, which can only trail
/// the oldest still-held guard.
pub(crate) struct GenerationHandler {
    current: AtomicU64,
    first_used: AtomicU64,
    last_hold: AtomicPtr<GenerationHold>,
    chain: Mutex<HoldChain>,
}

impl GenerationHandler {
    pub fn new() -> GenerationHandler {
        let first = Box::into_raw(Box::new(GenerationHold {
            refs: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }));

        GenerationHandler {
            current: AtomicU64::new(0),
            first_used: AtomicU64::new(0),
            last_hold: AtomicPtr::new(first),
            chain: Mutex::new(HoldChain {
                retired: VecDeque::new(),
                free: vec![],
            }),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.current.load(Acquire)
    }

    pub fn first_used_generation(&self) -> u64 {
        self.first_used.load(Acquire)
    }

    /// Pins the current generation. Lock-free: retries only
    /// when racing a concurrent generation change.
    pub fn take_guard(&self) -> GenerationGuard<'_> {
        loop {
            debug_delay();
            let ptr = self.last_hold.load(Acquire);
            let hold = unsafe { &*ptr };
            let prev = hold.refs.fetch_add(2, AcqRel);
            if prev & 1 == 1 {
                // the node was still current when we pinned
                // it, so its generation is stable while our
                // count is held
                let generation = hold.generation.load(Acquire);
                return GenerationGuard {
                    hold: ptr,
                    generation,
                    _handler: PhantomData,
                };
            }

            // raced a generation change onto a retired or
            // recycled node
            hold.refs.fetch_sub(2, Release);
            std::hint::spin_loop();
        }
    }

    /// Writer-only: makes `new_generation` the current write
    /// epoch and retires the previous hold node.
    pub fn on_generation_change(&self, new_generation: u64) {
        let mut chain = self.chain.lock().unwrap();

        let current = self.current.load(Relaxed);
        assert!(
            new_generation > current,
            "generation must advance monotonically: {} -> {}",
            current,
            new_generation,
        );

        let node = chain
            .free
            .pop()
            .unwrap_or_else(|| Box::into_raw(Box::new(GenerationHold::default())));

        unsafe {
            (*node).generation.store(new_generation, Relaxed);
            // set the valid bit; stray reader increments from
            // a lost race self-cancel, so never store an
            // absolute refcount
            (*node).refs.fetch_add(1, Release);
        }

        debug_delay();
        let old = self.last_hold.swap(node, AcqRel);
        unsafe {
            (*old).refs.fetch_sub(1, AcqRel);
        }
        chain.retired.push_back(old);

        self.current.store(new_generation, Release);
    }

    /// Drops retired hold nodes that no reader pins any
    /// more, recycles them, and publishes the oldest
    /// generation that may still be observed.
    pub fn update_first_used_generation(&self) -> u64 {
        let mut chain = self.chain.lock().unwrap();

        while let Some(&front) = chain.retired.front() {
            if unsafe { (*front).refs.load(Acquire) } == 0 {
                chain.retired.pop_front();
                chain.free.push(front);
            } else {
                break;
            }
        }

        let first = if let Some(&front) = chain.retired.front() {
            unsafe { (*front).generation.load(Relaxed) }
        } else {
            self.current.load(Relaxed)
        };

        self.first_used.store(first, Release);
        first
    }
}

impl Drop for GenerationHandler {
    fn drop(&mut self) {
        let chain = self
            .chain
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for ptr in chain.retired.drain(..).chain(chain.free.drain(..)) {
            drop(unsafe { Box::from_raw(ptr) });
        }
        let last = *self.last_hold.get_mut();
        drop(unsafe { Box::from_raw(last) });
    }
}

/// Reader-held token pinning one generation. While any
/// guard pins generation `g`, `first_used_generation` never
/// advances past `g`, so memory retired at or after `g`
/// stays valid.
pub(crate) struct GenerationGuard<'a> {
    hold: *const GenerationHold,
    generation: u64,
    _handler: PhantomData<&'a GenerationHandler>,
}

impl GenerationGuard<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            (*self.hold).refs.fetch_sub(2, Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_blocks_first_used_from_advancing() {
        let handler = GenerationHandler::new();
        assert_eq!(handler.current_generation(), 0);

        let guard = handler.take_guard();
        assert_eq!(guard.generation(), 0);

        handler.on_generation_change(1);
        handler.on_generation_change(2);
        assert_eq!(handler.current_generation(), 2);

        // generation 0 is still pinned
        assert_eq!(handler.update_first_used_generation(), 0);

        drop(guard);
        assert_eq!(handler.update_first_used_generation(), 2);
    }

    #[test]
    fn nested_guards_release_in_any_order() {
        let handler = GenerationHandler::new();

        let g0 = handler.take_guard();
        handler.on_generation_change(1);
        let g1 = handler.take_guard();
        handler.on_generation_change(2);

        assert_eq!(handler.update_first_used_generation(), 0);
        drop(g0);
        assert_eq!(handler.update_first_used_generation(), 1);
        drop(g1);
        assert_eq!(handler.update_first_used_generation(), 2);
    }

    #[test]
    fn hold_nodes_are_recycled() {
        let handler = GenerationHandler::new();
        for generation in 1..=1000 {
            handler.on_generation_change(generation);
            handler.update_first_used_generation();
        }
        let chain = handler.chain.lock().unwrap();
        assert!(chain.retired.is_empty());
        // every retired node was drained back onto the free
        // list rather than accumulating
        assert!(chain.free.len() <= 2);
    }

    #[test]
    #[should_panic(expected = "monotonically")]
    fn generation_must_advance() {
        let handler = GenerationHandler::new();
        handler.on_generation_change(5);
        handler.on_generation_change(5);
    }
}
