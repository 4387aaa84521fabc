//! The virtual machine: root object coordinating memory, threads and files.
//!
//! Owns the linear memory, the thread-id → handle table and the descriptor →
//! file table. Thread ids and descriptors come from monotonic counters with
//! linear probing over live entries so released values are eventually
//! reusable. Both counters and both tables live under one mutex; `running`
//! is an atomic flag every unit checks at its dispatch boundaries.

pub mod file;
pub mod registers;
pub mod thread;
pub mod unit;


use crate::errors::VmError;
use crate::memory::Memory;
use crate::module::Module;
use crate::warn;
use file::FileHandle;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thread::ThreadHandle;
use unit::ExecutionUnit;

/// Default stack size per thread: 4 MiB.
pub const DEFAULT_STACK_SIZE: u64 = 4 * 1024 * 1024;

struct VmState {
    entry_point: u64,
    threads: HashMap<u64, Arc<ThreadHandle>>,
    files: HashMap<u64, Arc<FileHandle>>,
    last_thread_id: u64,
    last_fd: u64,
}

/// A running instance of the machine.
pub struct VirtualMachine {
    stack_size: u64,
    memory: Arc<Memory>,
    running: AtomicBool,
    exit_status: AtomicU64,
    state: Mutex<VmState>,
    /// Signalled when a thread retires or the VM leaves the running state.
    threads_changed: Condvar,
}

impl VirtualMachine {
    /// Creates a machine with the given per-thread stack size.
    pub fn new(stack_size: u64) -> Arc<Self> {
        Arc::new(Self {
            stack_size,
            memory: Arc::new(Memory::new()),
            running: AtomicBool::new(false),
            exit_status: AtomicU64::new(0),
            state: Mutex::new(VmState {
                entry_point: 0,
                threads: HashMap::new(),
                files: HashMap::new(),
                last_thread_id: 0,
                last_fd: 0,
            }),
            threads_changed: Condvar::new(),
        })
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    /// Loads the module into linear memory and preopens descriptors 0, 1
    /// and 2 onto the process's stdio.
    pub fn init(&self, module: &Module) {
        self.memory.init(module);
        let mut state = self.state.lock();
        state.entry_point = module.entry_point;
        state.files.insert(0, Arc::new(FileHandle::stdin()));
        state.files.insert(1, Arc::new(FileHandle::stdout()));
        state.files.insert(2, Arc::new(FileHandle::stderr()));
        state.last_fd = 2;
    }

    /// Runs the module: spawns the root thread at the entry point and blocks
    /// until the thread table drains or `EXIT` clears the running flag.
    ///
    /// Returns the exit status (0 when the root thread simply finishes), or
    /// the root thread's fatal error.
    pub fn run(self: &Arc<Self>) -> Result<u64, VmError> {
        self.run_root().map(|(status, _root)| status)
    }

    /// Like [`Self::run`], but also hands back the root thread's handle so
    /// its final register state can be inspected.
    fn run_root(self: &Arc<Self>) -> Result<(u64, Arc<ThreadHandle>), VmError> {
        self.running.store(true, Ordering::SeqCst);
        let entry = self.state.lock().entry_point;
        let root = self.spawn_thread(entry)?;

        {
            let mut state = self.state.lock();
            while !state.threads.is_empty() && self.running.load(Ordering::SeqCst) {
                self.threads_changed.wait(&mut state);
            }
        }

        // After EXIT there may still be live workers; they observe the
        // cleared flag at their next dispatch boundary.
        loop {
            let straggler = self.state.lock().threads.values().next().cloned();
            match straggler {
                Some(handle) => handle.join(),
                None => break,
            }
        }

        root.join();
        match root.take_result() {
            Some(Err(e)) => Err(e),
            _ => Ok((self.exit_status.load(Ordering::SeqCst), root)),
        }
    }

    /// True until `exit` is called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests cooperative termination with the given status. Every
    /// executing thread terminates at its next dispatch boundary.
    pub fn exit(&self, status: u64) {
        let _state = self.state.lock();
        self.exit_status.store(status, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.threads_changed.notify_all();
    }

    /// Spawns a new thread executing at `entry` on a freshly allocated
    /// stack; returns its id.
    pub fn create_thread(self: &Arc<Self>, entry: u64) -> Result<u64, VmError> {
        self.spawn_thread(entry).map(|handle| handle.thread_id())
    }

    fn spawn_thread(self: &Arc<Self>, entry: u64) -> Result<Arc<ThreadHandle>, VmError> {
        let stack_base = self.memory.alloc(self.stack_size)?;
        let stack_top = stack_base + self.stack_size - 1;

        let handle = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let tid = Self::probe_id(&mut state.last_thread_id, |id| {
                !state.threads.contains_key(&id)
            });
            let unit = Arc::new(ExecutionUnit::new(
                Arc::clone(self),
                tid,
                stack_base,
                stack_top,
                entry,
            ));
            let handle = Arc::new(ThreadHandle::new(stack_base, unit));
            state.threads.insert(tid, Arc::clone(&handle));
            handle
        };

        handle.start(Arc::clone(self));
        Ok(handle)
    }

    /// Advances a monotonic counter past values still in use.
    fn probe_id(last: &mut u64, free: impl Fn(u64) -> bool) -> u64 {
        let mut id = last.wrapping_add(1);
        while !free(id) {
            id = id.wrapping_add(1);
        }
        *last = id;
        id
    }

    /// Removes a finished thread from the table and frees its stack.
    pub(crate) fn retire_thread(&self, thread_id: u64) {
        let mut state = self.state.lock();
        if let Some(handle) = state.threads.remove(&thread_id) {
            if let Err(e) = self.memory.free(handle.stack_base()) {
                warn!("thread {thread_id}: failed to free stack: {e}");
            }
        }
        self.threads_changed.notify_all();
    }

    fn thread_handle(&self, thread_id: u64) -> Option<Arc<ThreadHandle>> {
        self.state.lock().threads.get(&thread_id).cloned()
    }

    /// THREAD_CONTROL WAIT: blocks until the target's worker exits. A
    /// missing id means the thread already finished.
    pub fn join_thread(&self, thread_id: u64) {
        if let Some(handle) = self.thread_handle(thread_id) {
            handle.join();
        }
    }

    /// THREAD_CONTROL STOP: best-effort stop request.
    pub fn stop_thread(&self, thread_id: u64) {
        if let Some(handle) = self.thread_handle(thread_id) {
            handle.request_stop();
        }
    }

    /// Reads a register of another thread; `None` when the thread already
    /// finished.
    pub fn thread_get_register(
        &self,
        thread_id: u64,
        idx: u8,
    ) -> Result<Option<u64>, VmError> {
        match self.thread_handle(thread_id) {
            Some(handle) => handle.get_register(idx).map(Some),
            None => Ok(None),
        }
    }

    /// Writes a register of another thread; a no-op when the thread already
    /// finished.
    pub fn thread_set_register(
        &self,
        thread_id: u64,
        idx: u8,
        value: u64,
    ) -> Result<(), VmError> {
        match self.thread_handle(thread_id) {
            Some(handle) => handle.set_register(idx, value),
            None => Ok(()),
        }
    }

    // ==================== Syscalls ====================

    /// OPEN: installs a new descriptor for `path`.
    pub fn open(&self, path: String, flags: u64, mode: u64) -> Result<u64, VmError> {
        let handle = Arc::new(FileHandle::open(path, flags as u32, mode as u32)?);
        let mut state = self.state.lock();
        let state = &mut *state;
        let fd = Self::probe_id(&mut state.last_fd, |id| !state.files.contains_key(&id));
        state.files.insert(fd, handle);
        Ok(fd)
    }

    /// CLOSE: removes the descriptor. Preopened stdio entries are only
    /// removed from the table; the underlying streams stay open.
    pub fn close(&self, fd: u64) -> Result<(), VmError> {
        self.state
            .lock()
            .files
            .remove(&fd)
            .map(|_| ())
            .ok_or(VmError::InvalidFileDescriptor { fd })
    }

    fn file_handle(&self, fd: u64) -> Result<Arc<FileHandle>, VmError> {
        self.state
            .lock()
            .files
            .get(&fd)
            .cloned()
            .ok_or(VmError::InvalidFileDescriptor { fd })
    }

    /// READ: fills `buf` from the descriptor, returning the byte count. No
    /// VM lock is held across the underlying I/O.
    pub fn read(&self, fd: u64, buf: &mut [u8]) -> Result<usize, VmError> {
        self.file_handle(fd)?.read(buf)
    }

    /// WRITE: sends `buf` to the descriptor, returning the byte count.
    pub fn write(&self, fd: u64, buf: &[u8]) -> Result<usize, VmError> {
        self.file_handle(fd)?.write(buf)
    }
}
