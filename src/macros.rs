#![allow(unused_macros)]

/// Helper macro for locking items
///
/// ```rust, ignore
///  let mut cache = lock!(self.cache);
///  cache.types.insert(name, entry);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().expect("Failed to acquire lock")
    };
}

/// Helper macro for reading locked items
///
/// ```rust, ignore
///  let object = read_lock!(instance.inner);
///  println!("{}", object.type_name);
/// ```
macro_rules! read_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.read().expect("Failed to acquire read lock")
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut object = write_lock!(instance.inner);
///  object.fields.insert(name, value);
/// ```
macro_rules! write_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.write().expect("Failed to acquire write lock")
    };
}
