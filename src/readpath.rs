use std::sync::Arc;

use crate::generation::GenerationGuard;
use crate::{EntityId, Inner, Scree};

impl<T: Copy> Scree<T> {
    /// Read the current value sequence for an entity id. An
    /// id that has never been written (or was last written
    /// empty) reads as the empty slice.
    ///
    /// The id must be covered by a prior `ensure_size` or
    /// `set`. The returned view borrows the store, which is
    /// what keeps the writer from reclaiming it: no `&mut
    /// self` operation can run while it is held.
    pub fn get(&self, id: EntityId) -> &[T] {
        match self.inner.indices.load(id) {
            Some(entry) => self.inner.get(entry),
            None => &[],
        }
    }
}

pub(crate) fn reader<T: Copy>(inner: &Arc<Inner<T>>) -> ScreeReader<T> {
    ScreeReader {
        inner: Arc::clone(inner),
    }
}

/// Cheap cloneable handle for lock-free concurrent reads.
/// Any number of these may traverse the store from any
/// thread while the single writer mutates it.
pub struct ScreeReader<T: Copy> {
    inner: Arc<Inner<T>>,
}

impl<T: Copy> Clone for ScreeReader<T> {
    fn clone(&self) -> ScreeReader<T> {
        ScreeReader {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Copy> ScreeReader<T> {
    /// Pins the current generation for the duration of a
    /// traversal. While the guard is held, every array
    /// reachable through the index table stays valid even
    /// if the writer replaces it, compacts its buffer, and
    /// asks for old generations to be reclaimed.
    pub fn pin(&self) -> ReadGuard<'_, T> {
        ReadGuard {
            inner: &self.inner,
            guard: self.inner.gen.take_guard(),
        }
    }
}

/// Generation guard plus read access. Views handed out by
/// [`ReadGuard::get`] borrow the guard, so they cannot
/// outlive the pin that keeps their memory alive.
pub struct ReadGuard<'a, T: Copy> {
    inner: &'a Inner<T>,
    guard: GenerationGuard<'a>,
}

impl<T: Copy> ReadGuard<'_, T> {
    /// The pinned generation.
    pub fn generation(&self) -> u64 {
        self.guard.generation()
    }

    /// Read the value sequence that is current for `id` at
    /// some point during the guard's lifetime: either the
    /// pre- or post-replacement sequence if the writer races
    /// this load, never a mix.
    pub fn get(&self, id: EntityId) -> &[T] {
        match self.inner.indices.load(id) {
            Some(entry) => self.inner.get(entry),
            None => &[],
        }
    }
}
