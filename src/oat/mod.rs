//! Dense object allocation table
//!
//! Maps small integer IDs to heap objects. IDs come from an [`IdPool`] so
//! freed IDs are recycled before never-issued ones, keeping the table dense.
//! Object construction and destruction are delegated to an
//! [`ObjectFactory`], which receives a caller-provided environment (usually
//! the capability space) so objects can own kernel resources.

use alloc::vec::Vec;

use crate::error::{SrvError, SrvResult};
use crate::pool::IdPool;
use crate::types::{ObjId, Word};

/// Number of words in the generic creation argument block
pub const COAT_ARGS: usize = 4;

/// Generic creation arguments
pub type OatArgs = [Word; COAT_ARGS];

// ============================================================================
// Factory
// ============================================================================

/// Creates and destroys the objects of one table
pub trait ObjectFactory {
    /// Object stored per ID
    type Object;
    /// Creation arguments
    type Args;
    /// Environment passed through to create and destroy
    type Env: ?Sized;

    /// Build the object for a freshly allocated `id`.
    ///
    /// On error the ID goes back to the pool and the error is returned from
    /// [`ObjectTable::alloc`]. Any resources carried in `args` must already
    /// have been reclaimed.
    fn create(&mut self, env: &mut Self::Env, id: ObjId, args: Self::Args) -> SrvResult<Self::Object>;

    /// Tear down an object. Cannot fail; problems are logged.
    fn destroy(&mut self, env: &mut Self::Env, id: ObjId, obj: Self::Object);

    /// Reclaim `args` when no ID was available to create an object
    fn reject(&mut self, _env: &mut Self::Env, _args: Self::Args) {}
}

// ============================================================================
// Object table
// ============================================================================

/// Dense table of objects indexed by ID in `[start, end)`
pub struct ObjectTable<F: ObjectFactory> {
    pool: IdPool,
    table: Vec<Option<F::Object>>,
    factory: F,
}

impl<F: ObjectFactory> ObjectTable<F> {
    /// Create a table over `[start, end)`. ID 0 is never issued, so `start`
    /// must be at least 1.
    pub fn new(start: ObjId, end: ObjId, factory: F) -> SrvResult<Self> {
        if start == 0 || end < start {
            return Err(SrvError::InvalidArgument);
        }
        Ok(Self {
            pool: IdPool::new(start, end),
            table: Vec::new(),
            factory,
        })
    }

    /// Allocate an ID and create its object
    pub fn alloc(&mut self, env: &mut F::Env, args: F::Args) -> SrvResult<(ObjId, &mut F::Object)> {
        let Some(id) = self.pool.alloc() else {
            self.factory.reject(env, args);
            return Err(SrvError::ResourceExhausted);
        };

        if self.table.len() <= id {
            self.table.resize_with(id + 1, || None);
        }

        if self.table[id].is_none() {
            match self.factory.create(env, id, args) {
                Ok(obj) => self.table[id] = Some(obj),
                Err(e) => {
                    self.pool.free(id);
                    return Err(e);
                }
            }
        } else {
            // Slot reused without an intervening free; keep the existing object
            log::warn!("object table: id {} already populated", id);
            self.factory.reject(env, args);
        }

        match self.table[id].as_mut() {
            Some(obj) => Ok((id, obj)),
            None => Err(SrvError::NotFound),
        }
    }

    /// Look up a live object
    pub fn get(&self, id: ObjId) -> Option<&F::Object> {
        if !self.in_range(id) {
            return None;
        }
        self.table.get(id).and_then(Option::as_ref)
    }

    /// Look up a live object mutably
    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut F::Object> {
        if !self.in_range(id) {
            return None;
        }
        self.table.get_mut(id).and_then(Option::as_mut)
    }

    /// Destroy the object for `id` and recycle the ID
    pub fn free(&mut self, env: &mut F::Env, id: ObjId) -> SrvResult<()> {
        if self.pool.is_free(id) {
            return Err(SrvError::NotAllocated);
        }
        let obj = self
            .table
            .get_mut(id)
            .and_then(Option::take)
            .ok_or(SrvError::NotFound)?;
        self.factory.destroy(env, id, obj);
        self.pool.free(id);
        Ok(())
    }

    /// Destroy every live object and drop the table, returning the factory
    pub fn release(mut self, env: &mut F::Env) -> F {
        for (id, slot) in self.table.iter_mut().enumerate() {
            if let Some(obj) = slot.take() {
                self.factory.destroy(env, id, obj);
            }
        }
        self.factory
    }

    /// Live objects in ID order
    pub fn iter(&self) -> impl Iterator<Item = (ObjId, &F::Object)> {
        self.table
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|obj| (id, obj)))
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.table.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether no object is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The ID range `[start, end)`
    pub fn range(&self) -> core::ops::Range<ObjId> {
        self.pool.start()..self.pool.end()
    }

    /// The factory
    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn in_range(&self, id: ObjId) -> bool {
        self.range().contains(&id)
    }
}
