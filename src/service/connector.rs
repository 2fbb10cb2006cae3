use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use super::{NameService, ServiceError, BALANCER_LOCK_PATH};

/// Iterations with zero moved bytes tolerated before the run gives up.
const MAX_NOT_CHANGED_ITERATIONS: u32 = 5;

/// One live attachment to a name service. Holds the exclusive balancer
/// lease for the lifetime of the run, owns the cumulative bytes-moved
/// counter, and watches for stalled progress.
pub struct Connector {
    name: String,
    service: Arc<dyn NameService>,
    holder: String,
    bytes_moved: AtomicU64,
    not_changed_iterations: Mutex<u32>,
}

impl Connector {
    /// Attach to the service and take the exclusive lease. Fails with
    /// [`ServiceError::LockContention`] while another balancer is active.
    pub fn connect(name: String, service: Arc<dyn NameService>) -> Result<Arc<Self>, ServiceError> {
        let holder = format!("balancer-{}@{name}", std::process::id());
        service.acquire_lease(&holder)?;
        info!("{name}: acquired the balancer lease at {BALANCER_LOCK_PATH}");
        Ok(Arc::new(Self {
            name,
            service,
            holder,
            bytes_moved: AtomicU64::new(0),
            not_changed_iterations: Mutex::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &Arc<dyn NameService> {
        &self.service
    }

    pub fn add_bytes_moved(&self, bytes: u64) {
        self.bytes_moved.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved.load(Ordering::SeqCst)
    }

    /// False once the service made no forward progress for five
    /// consecutive iterations.
    pub fn should_continue(&self, bytes_moved_this_iteration: u64) -> bool {
        let mut stalled = self.not_changed_iterations.lock();
        if bytes_moved_this_iteration > 0 {
            *stalled = 0;
            return true;
        }
        *stalled += 1;
        *stalled < MAX_NOT_CHANGED_ITERATIONS
    }

    /// Give the lease back; every exit path runs through here.
    pub fn close(&self) {
        self.service.release_lease(&self.holder);
    }
}
