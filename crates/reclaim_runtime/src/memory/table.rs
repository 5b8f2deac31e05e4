use super::class::ClassId;
use super::object::{Object, ObjectFlags, ObjectHandle};

/// Slot-indexed storage for every managed object.
///
/// Slot 0 is never used so that a raw handle of 0 can mean null. Freed slots
/// are recycled through a free list. Indices below the permanent boundary form
/// the permanent pool: those objects are never marked, traced or freed.
#[derive(Debug)]
pub struct ObjectTable {
    slots: Vec<Option<Object>>,
    free_list: Vec<u32>,
    permanent_boundary: u32,
    live: usize,
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None],
            free_list: Vec::new(),
            permanent_boundary: 1,
            live: 0,
        }
    }

    pub(crate) fn allocate(
        &mut self,
        class: ClassId,
        name: String,
        fields: Box<[super::object::Field]>,
    ) -> Option<ObjectHandle> {
        let index = match self.free_list.pop() {
            Some(index) => index as usize,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let handle = ObjectHandle::from_index(index)?;
        self.slots[index] = Some(Object::new(handle, class, name, fields));
        self.live += 1;
        Some(handle)
    }

    /// Remove the object in `handle`'s slot. Permanent objects are never freed.
    pub(crate) fn free(&mut self, handle: ObjectHandle) -> Option<Object> {
        if self.resides_in_permanent_pool(handle.to_raw()) {
            return None;
        }
        let object = self.slots.get_mut(handle.index())?.take()?;
        self.free_list.push(handle.to_raw());
        self.live -= 1;
        Some(object)
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&Object> {
        self.slot(handle.index())
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut Object> {
        self.slots.get_mut(handle.index())?.as_mut()
    }

    /// Resolve a raw slot value; `None` for null, freed or out-of-range.
    pub fn get_raw(&self, raw: u32) -> Option<&Object> {
        self.slot(raw as usize)
    }

    pub fn slot(&self, index: usize) -> Option<&Object> {
        self.slots.get(index)?.as_ref()
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Whether `raw` indexes the permanent pool. Pure index test.
    pub const fn resides_in_permanent_pool(&self, raw: u32) -> bool {
        raw != 0 && raw < self.permanent_boundary
    }

    /// Freeze every object allocated so far into the permanent pool.
    pub fn close_permanent_pool(&mut self) {
        self.permanent_boundary = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        let boundary = self.permanent_boundary;
        self.free_list.retain(|&index| index >= boundary);
        tracing::info!(
            objects = self.permanent_pool_len(),
            "closed permanent object pool"
        );
    }

    pub fn permanent_pool_len(&self) -> usize {
        (1..self.first_gc_index())
            .filter(|&index| self.slot(index).is_some())
            .count()
    }

    /// First slot index the collector considers.
    pub const fn first_gc_index(&self) -> usize {
        self.permanent_boundary as usize
    }

    /// Number of slots, free ones included.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live objects.
    pub const fn len(&self) -> usize {
        self.live
    }

    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live objects outside the permanent pool.
    pub fn iter_collectable(&self) -> impl Iterator<Item = &Object> {
        self.slots[self.first_gc_index().min(self.slots.len())..]
            .iter()
            .filter_map(Option::as_ref)
    }

    /// Live objects in the permanent pool.
    pub fn iter_permanent(&self) -> impl Iterator<Item = &Object> {
        self.slots[..self.first_gc_index().min(self.slots.len())]
            .iter()
            .filter_map(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn count_with_flags(&self, flags: ObjectFlags) -> usize {
        self.iter_collectable()
            .filter(|object| object.flags().contains(flags))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::class::{ClassDescriptor, ClassRegistry};

    fn table_with_class() -> (ObjectTable, ClassId) {
        let mut registry = ClassRegistry::new();
        let class = registry.register(ClassDescriptor::new("Blob")).unwrap();
        (ObjectTable::new(), class)
    }

    #[test]
    fn test_slot_zero_is_reserved() {
        let (mut table, class) = table_with_class();
        let handle = table.allocate(class, "a".into(), Box::new([])).unwrap();
        assert_eq!(handle.index(), 1);
        assert!(table.get_raw(0).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let (mut table, class) = table_with_class();
        let a = table.allocate(class, "a".into(), Box::new([])).unwrap();
        let _b = table.allocate(class, "b".into(), Box::new([])).unwrap();
        assert!(table.free(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.free(a).is_none());

        let c = table.allocate(class, "c".into(), Box::new([])).unwrap();
        assert_eq!(c, a);
        assert_eq!(table.get(c).unwrap().name(), "c");
        assert_eq!(table.capacity(), 3);
    }

    #[test]
    fn test_permanent_pool_is_frozen() {
        let (mut table, class) = table_with_class();
        let engine = table.allocate(class, "engine".into(), Box::new([])).unwrap();
        let scratch = table.allocate(class, "scratch".into(), Box::new([])).unwrap();
        table.free(scratch);
        table.close_permanent_pool();

        assert!(table.resides_in_permanent_pool(engine.to_raw()));
        assert!(!table.resides_in_permanent_pool(0));
        assert!(table.free(engine).is_none());
        assert_eq!(table.permanent_pool_len(), 1);

        let fresh = table.allocate(class, "fresh".into(), Box::new([])).unwrap();
        assert!(!table.resides_in_permanent_pool(fresh.to_raw()));
        assert_eq!(table.iter_collectable().count(), 1);
    }
}
