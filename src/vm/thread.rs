//! Thread handles: one OS worker per execution unit.

use crate::errors::VmError;
use crate::vm::unit::ExecutionUnit;
use crate::vm::VirtualMachine;
use crate::{error, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Pairs an [`ExecutionUnit`] with its OS-level worker.
///
/// The VM owns every handle through its thread table; the handle exclusively
/// owns its unit. A handle must not outlive its VM (the unit keeps the VM
/// alive through an `Arc` until the worker retires itself).
pub struct ThreadHandle {
    unit: Arc<ExecutionUnit>,
    /// Base of the stack allocation this thread runs on; freed on retirement.
    stack_base: u64,
    /// Start mutex: the worker is spawned at most once.
    worker: Mutex<Option<JoinHandle<()>>>,
    started: Mutex<bool>,
    finished: Mutex<bool>,
    finished_cv: Condvar,
    result: Mutex<Option<Result<(), VmError>>>,
}

impl ThreadHandle {
    pub fn new(stack_base: u64, unit: Arc<ExecutionUnit>) -> Self {
        Self {
            unit,
            stack_base,
            worker: Mutex::new(None),
            started: Mutex::new(false),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
            result: Mutex::new(None),
        }
    }

    pub fn thread_id(&self) -> u64 {
        self.unit.thread_id()
    }

    pub fn stack_base(&self) -> u64 {
        self.stack_base
    }

    /// Launches the worker bound to this unit's run loop. Idempotent: a
    /// second call does nothing.
    pub fn start(self: &Arc<Self>, vm: Arc<VirtualMachine>) {
        let mut started = self.started.lock();
        if *started {
            return;
        }
        *started = true;

        let handle = Arc::clone(self);
        let worker_vm = Arc::clone(&vm);
        let spawned = std::thread::Builder::new()
            .name(format!("lvm-{}", self.thread_id()))
            .spawn(move || handle.worker_main(worker_vm));
        match spawned {
            Ok(join) => *self.worker.lock() = Some(join),
            Err(e) => {
                error!("failed to spawn worker for thread {}: {e}", self.thread_id());
                // Retire immediately so joiners and the VM's run loop do not
                // wait on a worker that never ran.
                vm.retire_thread(self.thread_id());
                let mut finished = self.finished.lock();
                *finished = true;
                self.finished_cv.notify_all();
            }
        }
    }

    fn worker_main(self: Arc<Self>, vm: Arc<VirtualMachine>) {
        let outcome = self.unit.run();
        if let Err(e) = &outcome {
            error!("thread {} faulted: {e}", self.thread_id());
        }
        *self.result.lock() = Some(outcome);
        vm.retire_thread(self.thread_id());
        let mut finished = self.finished.lock();
        *finished = true;
        self.finished_cv.notify_all();
    }

    /// Blocks until the worker exits. Safe to call from several threads;
    /// late callers wait on the finished flag.
    pub fn join(&self) {
        let taken = self.worker.lock().take();
        match taken {
            Some(join) => {
                if join.join().is_err() {
                    warn!("worker for thread {} panicked", self.thread_id());
                }
            }
            None => {
                let mut finished = self.finished.lock();
                while !*finished {
                    self.finished_cv.wait(&mut finished);
                }
            }
        }
    }

    /// Best-effort stop request; the unit observes it at its next dispatch
    /// boundary.
    pub fn request_stop(&self) {
        self.unit.request_stop();
    }

    /// Reads a register of this handle's unit under its mutex.
    pub fn get_register(&self, idx: u8) -> Result<u64, VmError> {
        self.unit.get_register(idx)
    }

    /// Writes a register of this handle's unit under its mutex.
    pub fn set_register(&self, idx: u8, value: u64) -> Result<(), VmError> {
        self.unit.set_register(idx, value)
    }

    /// Takes the unit's final result, once the worker has stored it.
    pub fn take_result(&self) -> Option<Result<(), VmError>> {
        self.result.lock().take()
    }
}
