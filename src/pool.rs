use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::{fmt, mem};

pub trait Recyclable {
    fn new() -> Self;
    fn reset(&mut self);
    /// Memory held by the item, used to decide if it is worth keeping
    fn footprint(&self) -> usize;
}

impl Recyclable for Vec<u8> {
    fn new() -> Self {
        Vec::new()
    }

    fn reset(&mut self) {
        self.clear();
    }

    fn footprint(&self) -> usize {
        self.capacity()
    }
}

/// A bounded free list of reusable items
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    max_items: usize,
    max_footprint: usize,
}

impl<T: Recyclable> Pool<T> {
    pub fn new(max_items: usize, max_footprint: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(max_items)),
            max_items,
            max_footprint,
        }
    }

    pub fn detached(&self) -> T {
        self.items.lock().pop().unwrap_or_else(T::new)
    }

    pub fn get(&self) -> Handle<'_, T> {
        self.attach(self.detached())
    }

    pub fn attach(&self, item: T) -> Handle<'_, T> {
        Handle {
            value: ManuallyDrop::new(item),
            pool: self,
        }
    }

    fn return_item(&self, mut item: T) {
        if item.footprint() > self.max_footprint {
            return;
        }
        let mut items = self.items.lock();
        if items.len() < self.max_items {
            item.reset();
            items.push(item);
        }
    }
}

pub struct Handle<'a, T: Recyclable> {
    value: ManuallyDrop<T>,
    pool: &'a Pool<T>,
}

impl<T: Recyclable> Handle<'_, T> {
    pub fn detach(mut self) -> T {
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        mem::forget(self);
        value
    }
}

impl<T: Recyclable> Deref for Handle<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T: Recyclable> DerefMut for Handle<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T: fmt::Debug + Recyclable> fmt::Debug for Handle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T: Recyclable> Drop for Handle<'_, T> {
    fn drop(&mut self) {
        let item = unsafe { ManuallyDrop::take(&mut self.value) };
        self.pool.return_item(item);
    }
}

pub type Buffer = Handle<'static, Vec<u8>>;

/// Largest buffer kept for reuse: a compressed maximum-size container plus slack
const MAX_KEPT_BUFFER: usize = repr::CONTAINER_SIZE_MAX as usize / 8;

fn buffers() -> &'static Pool<Vec<u8>> {
    static INSTANCE: OnceCell<Pool<Vec<u8>>> = OnceCell::new();

    INSTANCE.get_or_init(|| Pool::new(num_cpus::get() * 2, MAX_KEPT_BUFFER))
}

pub fn buffer() -> Buffer {
    buffers().get()
}
