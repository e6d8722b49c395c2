use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use sorrel_common::{RtResult, RuntimeError, ERR_THREAD};

use crate::Value;

/// Runtime limits and sandbox policy, fixed for the life of a program run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// per-loop-frame iteration budget
    pub cycle_limit: u64,
    /// maximum nested function-call frames
    pub depth_limit: usize,
    pub sandbox: bool,
    pub fs_read_limit: u32,
    pub fs_write_limit: u32,
    /// largest file the sandbox will read or write, in bytes
    pub fs_size_limit: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cycle_limit: 16_000_000,
            depth_limit: 1000,
            sandbox: false,
            fs_read_limit: 64,
            fs_write_limit: 64,
            fs_size_limit: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Queued,
    Running,
    Paused,
    Waiting,
    Finished,
    Errored,
    Closed,
}

impl ThreadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadStatus::Finished | ThreadStatus::Errored | ThreadStatus::Closed)
    }
}

/// Shared per-thread control block. The running thread flips `status`;
/// other threads post `close`/`pause` requests that are honored at the
/// VM's safe dispatch points.
pub struct ThreadSlot {
    pub status: Mutex<ThreadStatus>,
    pub changed: Condvar,
    pub close: AtomicBool,
    pub pause: AtomicBool,
    pub error: Mutex<Option<RuntimeError>>,
}

impl ThreadSlot {
    fn new() -> Self {
        Self {
            status: Mutex::new(ThreadStatus::Queued),
            changed: Condvar::new(),
            close: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    pub fn set_status(&self, st: ThreadStatus) {
        *self.status.lock().unwrap() = st;
        self.changed.notify_all();
    }

    pub fn status(&self) -> ThreadStatus {
        *self.status.lock().unwrap()
    }

    /// Block until the thread reaches a terminal status.
    pub fn wait_done(&self) {
        let mut st = self.status.lock().unwrap();
        while !st.is_terminal() {
            st = self.changed.wait(st).unwrap();
        }
    }

    /// Park while a pause request is in force. Returns false when a close
    /// request arrived instead.
    pub fn park_if_paused(&self) -> bool {
        if !self.pause.load(Ordering::Acquire) { return true; }
        let mut st = self.status.lock().unwrap();
        let prev = *st;
        *st = ThreadStatus::Paused;
        self.changed.notify_all();
        while self.pause.load(Ordering::Acquire) {
            if self.close.load(Ordering::Acquire) { return false; }
            st = self.changed.wait(st).unwrap();
        }
        *st = prev;
        self.changed.notify_all();
        true
    }
}

#[derive(Default)]
pub struct ThreadTable {
    slots: Mutex<Vec<Arc<ThreadSlot>>>,
}

impl ThreadTable {
    /// Register a new thread; ids are 1-based so scripts can treat 0 as "none".
    pub fn register(&self) -> (i64, Arc<ThreadSlot>) {
        let mut slots = self.slots.lock().unwrap();
        let slot = Arc::new(ThreadSlot::new());
        slots.push(slot.clone());
        (slots.len() as i64, slot)
    }

    pub fn get(&self, id: i64) -> RtResult<Arc<ThreadSlot>> {
        let slots = self.slots.lock().unwrap();
        if id < 1 || id as usize > slots.len() {
            return Err(RuntimeError::new(ERR_THREAD, format!("unknown thread {}", id)));
        }
        Ok(slots[(id - 1) as usize].clone())
    }
}

/// State shared by every thread of one running program: the lazily
/// populated named-constant cache and the host-visible context map, both
/// behind reader/writer locks, plus the thread table and sandbox budgets.
pub struct RtShared {
    pub settings: Settings,
    pub consts: RwLock<HashMap<u32, Value>>,
    pub context: RwLock<HashMap<String, Value>>,
    pub threads: ThreadTable,
    pub fs_reads: AtomicU32,
    pub fs_writes: AtomicU32,
}

impl RtShared {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            consts: RwLock::new(HashMap::new()),
            context: RwLock::new(HashMap::new()),
            threads: ThreadTable::default(),
            fs_reads: AtomicU32::new(0),
            fs_writes: AtomicU32::new(0),
        }
    }
}
