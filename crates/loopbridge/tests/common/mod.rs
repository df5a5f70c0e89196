//! A fake reference-counted native library for integration tests.
//!
//! `FakeSession` plays the native handle: manual refcount, a detached flag,
//! and async calls that complete on a pool of worker threads.

#![allow(dead_code)]

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use loopbridge::{
    AsyncCall, AsyncOperation, BridgeConfig, BridgeError, HostLoop, ManagedResource, NativeError,
    NativeObject, Promise, Ready, Result, RuntimeRegistry,
};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("LOOPBRIDGE_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn host() -> HostLoop {
    init_tracing();
    HostLoop::new(BridgeConfig::default().with_idle_timeout(Duration::from_millis(5))).unwrap()
}

pub fn runtime(host: &HostLoop) -> Arc<RuntimeRegistry> {
    let runtime = RuntimeRegistry::new(host).unwrap();
    runtime.register_constructor::<FakeSession, Session, _>("session", |resource| Ok(Session { resource }));
    runtime
}

// =============================================================================
// Worker pool the fake library completes its calls on
// =============================================================================

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..size)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("fake-worker-{i}"))
                    .spawn(move || loop {
                        let job = rx.lock().unwrap().recv();
                        match job {
                            Ok(job) => job(),
                            Err(_) => return,
                        }
                    })
                    .unwrap()
            })
            .collect();
        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            tx.send(Box::new(job)).unwrap();
        }
    }

    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.join().unwrap();
        }
    }
}

// =============================================================================
// FakeSession - the native handle
// =============================================================================

pub struct SessionState {
    pub pid: u32,
    pub detached: AtomicBool,
}

pub struct FakeSession {
    refs: AtomicUsize,
    state: Arc<SessionState>,
    freed: Arc<AtomicBool>,
}

/// Observer for a native session that survives its deallocation.
#[derive(Clone)]
pub struct SessionObserver {
    pub state: Arc<SessionState>,
    pub freed: Arc<AtomicBool>,
}

impl SessionObserver {
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::SeqCst)
    }

    pub fn detach(&self) {
        self.state.detached.store(true, Ordering::SeqCst);
    }
}

impl FakeSession {
    /// A new native session holding one reference, owned by the caller.
    pub fn create(pid: u32) -> (NonNull<FakeSession>, SessionObserver) {
        let state = Arc::new(SessionState { pid, detached: AtomicBool::new(false) });
        let freed = Arc::new(AtomicBool::new(false));
        let session = Box::new(FakeSession {
            refs: AtomicUsize::new(1),
            state: state.clone(),
            freed: freed.clone(),
        });
        let ptr = NonNull::from(Box::leak(session));
        (ptr, SessionObserver { state, freed })
    }

    pub fn is_detached(&self) -> bool {
        self.state.detached.load(Ordering::SeqCst)
    }
}

unsafe impl NativeObject for FakeSession {
    unsafe fn retain(ptr: NonNull<Self>) {
        ptr.as_ref().refs.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn release(ptr: NonNull<Self>) {
        if ptr.as_ref().refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            let session = Box::from_raw(ptr.as_ptr());
            session.freed.store(true, Ordering::SeqCst);
        }
    }
}

/// Wrap a freshly created session, transferring the creation reference.
pub fn adopt_session(runtime: &Arc<RuntimeRegistry>, pid: u32) -> (Arc<ManagedResource<FakeSession>>, SessionObserver) {
    let (ptr, observer) = FakeSession::create(pid);
    let resource = unsafe { ManagedResource::adopt(runtime, ptr) };
    (resource, observer)
}

// =============================================================================
// Host-side wrapper
// =============================================================================

pub struct Session {
    pub resource: Arc<ManagedResource<FakeSession>>,
}

impl Session {
    /// Validates synchronously, then runs the native call.
    pub fn enable_debugger(&self, pool: &Arc<WorkerPool>, port: i64) -> Result<Promise<()>> {
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| BridgeError::BadArgument("expected a port number".into()))?;
        let mut op = AsyncOperation::new(EnableDebugger { pool: pool.clone(), port });
        op.schedule(&self.resource)?;
        op.promise().ok_or(BridgeError::AlreadyScheduled)
    }

    pub fn detach(&self, pool: &Arc<WorkerPool>) -> Result<Promise<()>> {
        let mut op = AsyncOperation::new(Detach { pool: pool.clone() });
        op.schedule(&self.resource)?;
        op.promise().ok_or(BridgeError::AlreadyScheduled)
    }

    pub fn query_pid(&self, pool: &Arc<WorkerPool>) -> Result<Promise<u32>> {
        let mut op = AsyncOperation::new(QueryPid { pool: pool.clone() });
        op.schedule(&self.resource)?;
        op.promise().ok_or(BridgeError::AlreadyScheduled)
    }
}

// =============================================================================
// Async calls
// =============================================================================

pub struct Detach {
    pub pool: Arc<WorkerPool>,
}

impl AsyncCall for Detach {
    type Target = FakeSession;
    type Ready = ();
    type Output = ();
    type Value = ();

    fn begin(&self, target: &FakeSession, ready: Ready<()>) {
        let state = target.state.clone();
        self.pool.spawn(move || {
            state.detached.store(true, Ordering::SeqCst);
            ready.complete(());
        });
    }

    fn end(&self, _target: &FakeSession, _ready: ()) -> Result<(), NativeError> {
        Ok(())
    }

    fn result(&self, _output: (), _runtime: &Arc<RuntimeRegistry>) -> Result<()> {
        Ok(())
    }
}

pub struct QueryPid {
    pub pool: Arc<WorkerPool>,
}

impl AsyncCall for QueryPid {
    type Target = FakeSession;
    type Ready = Option<u32>;
    type Output = u32;
    type Value = u32;

    fn begin(&self, target: &FakeSession, ready: Ready<Option<u32>>) {
        let state = target.state.clone();
        self.pool.spawn(move || {
            let pid = (!state.detached.load(Ordering::SeqCst)).then_some(state.pid);
            ready.complete(pid);
        });
    }

    fn end(&self, _target: &FakeSession, ready: Option<u32>) -> Result<u32, NativeError> {
        ready.ok_or_else(|| NativeError::new(1, "session is detached"))
    }

    fn result(&self, pid: u32, _runtime: &Arc<RuntimeRegistry>) -> Result<u32> {
        Ok(pid)
    }
}

pub struct EnableDebugger {
    pub pool: Arc<WorkerPool>,
    pub port: u16,
}

impl AsyncCall for EnableDebugger {
    type Target = FakeSession;
    type Ready = bool;
    type Output = ();
    type Value = ();

    fn begin(&self, target: &FakeSession, ready: Ready<bool>) {
        if target.is_detached() {
            ready.fail(NativeError::new(1, "session is detached"));
            return;
        }
        let port = self.port;
        self.pool.spawn(move || ready.complete(port >= 1024));
    }

    fn end(&self, _target: &FakeSession, bound: bool) -> Result<(), NativeError> {
        if bound {
            Ok(())
        } else {
            Err(NativeError::new(13, "permission denied"))
        }
    }

    fn result(&self, _output: (), _runtime: &Arc<RuntimeRegistry>) -> Result<()> {
        Ok(())
    }
}

/// Which collaborator hook of [`Faulty`] unwinds.
#[derive(Clone, Copy)]
pub enum Fault {
    End,
    Result,
}

/// Completes on the pool, then panics in the chosen hook.
pub struct Faulty {
    pub pool: Arc<WorkerPool>,
    pub fault: Fault,
}

impl AsyncCall for Faulty {
    type Target = FakeSession;
    type Ready = ();
    type Output = ();
    type Value = ();

    fn begin(&self, _target: &FakeSession, ready: Ready<()>) {
        self.pool.spawn(move || ready.complete(()));
    }

    fn end(&self, _target: &FakeSession, _ready: ()) -> Result<(), NativeError> {
        match self.fault {
            Fault::End => panic!("end hook failed"),
            Fault::Result => Ok(()),
        }
    }

    fn result(&self, _output: (), _runtime: &Arc<RuntimeRegistry>) -> Result<()> {
        match self.fault {
            Fault::End => Ok(()),
            Fault::Result => panic!("result hook failed"),
        }
    }
}
