use std::sync::{Mutex, OnceLock};

/// Global lock for tests that install signal handlers or send signals to the
/// test process itself. Signal dispositions are process-wide, so parallel test
/// threads must not observe each other's deliveries.
pub static SIGNAL_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn signal_lock() -> std::sync::MutexGuard<'static, ()> {
    SIGNAL_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
