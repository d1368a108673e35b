// Library interface for gul
// This allows the guld binary and integration tests to access internal modules

pub mod bundle;
pub mod conn;
pub mod daemon;
pub mod error;
pub mod http;
pub mod view;

pub use bundle::{DirStore, Manifest, MemStore, PackageInfo, PackageStore, ServeOptions};
pub use daemon::supervisor::Supervisor;
pub use error::{GulError, Result};

pub(crate) mod sync {
    use std::sync::{Mutex, MutexGuard};

    // Panics are routine here (controller fault domains), so a poisoned
    // mutex is recovered rather than propagated.
    pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
