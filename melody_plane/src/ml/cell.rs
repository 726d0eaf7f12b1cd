#[cfg(not(feature = "threadpool"))]
use std::cell::UnsafeCell;
#[cfg(feature = "threadpool")]
use std::sync::Mutex;

#[cfg(feature = "threadpool")]
#[derive(Debug, Default)]
pub(crate) struct MutexCell<T>(Mutex<T>);

#[cfg(feature = "threadpool")]
impl<T> MutexCell<T> {
    pub fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    pub fn with_inner<F: FnOnce(&mut T) -> O, O>(&self, func: F) -> O {
        // a poisoned generator is still a valid generator
        let mut cell = match self.0.lock() {
            Ok(cell) => cell,
            Err(poisoned) => poisoned.into_inner(),
        };
        func(&mut *cell)
    }
}

#[cfg(not(feature = "threadpool"))]
#[derive(Debug, Default)]
pub(crate) struct MutexCell<T>(UnsafeCell<T>);

// without 'threadpool' every access happens on the owning thread
#[cfg(not(feature = "threadpool"))]
unsafe impl<T: Send> Sync for MutexCell<T> {}

#[cfg(not(feature = "threadpool"))]
impl<T> MutexCell<T> {
    pub fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    pub fn with_inner<F: FnOnce(&mut T) -> O, O>(&self, func: F) -> O {
        let inner = unsafe { &mut *self.0.get() };
        func(inner)
    }
}

impl<T: Clone> Clone for MutexCell<T> {
    fn clone(&self) -> Self {
        Self::new(self.with_inner(|x| x.clone()))
    }
}
