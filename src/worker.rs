//! Single-worker asynchronous dispatch
//!
//! An async connection owns exactly one worker thread, and that thread owns
//! all server I/O. Callers push requests at the front of a deque; the worker
//! pops from the back, so requests complete in enqueue order. Completion is
//! signalled per request: each finished request lands in a completion map
//! keyed by its process-wide sequence number, and a condition variable wakes
//! anyone waiting on a specific sequence.
//!
//! Transaction and program requests carry no work of their own. They exist
//! as barriers: enqueue one and wait for it, and every execution queued
//! before it has completed server-side.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::connection::Shared;
use crate::execution::{ExecContext, ExecutionHandle};

/// Request sequence number; process-wide monotonic, starting at 1
pub type RequestSequence = i64;

static NEXT_SEQUENCE: AtomicI64 = AtomicI64::new(1);

/// Kinds of requests queued to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum RequestType {
    /// Placeholder for an empty request slot
    #[default]
    None,
    /// Crank the server-facing tail of an execution
    Execution,
    /// Barrier before a transaction starts
    StartTransaction,
    /// Barrier before a commit
    Commit,
    /// Barrier before a rollback
    Rollback,
    /// Barrier before a program opens
    StartProgram,
    /// Barrier before a program closes
    EndProgram,
    /// Stop the worker
    Kill,
}

/// One queued request and, once processed, its outcome
#[derive(Debug, Clone, Default)]
pub(crate) struct Request {
    pub rtype: RequestType,
    pub sequence: RequestSequence,
    pub int_param: ExecutionHandle,
    pub string_param: String,
    pub rc: i64,
    pub error_no: i64,
    pub error_message: String,
}

impl Request {
    fn new(rtype: RequestType, int_param: ExecutionHandle, string_param: &str) -> Request {
        Request {
            rtype,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            int_param,
            string_param: string_param.to_string(),
            rc: 0,
            error_no: 0,
            error_message: String::new(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rtype {
            RequestType::None => write!(f, "{} NO_REQUEST", self.sequence),
            RequestType::Execution => {
                write!(f, "{} EXECUTION: execution {}", self.sequence, self.int_param)
            }
            RequestType::StartTransaction => {
                write!(f, "{} START_TRANSACTION: {}", self.sequence, self.string_param)
            }
            RequestType::Commit => write!(f, "{} COMMIT", self.sequence),
            RequestType::Rollback => write!(f, "{} ROLLBACK: {}", self.sequence, self.string_param),
            RequestType::StartProgram => {
                write!(f, "{} START_PROGRAM: {}", self.sequence, self.string_param)
            }
            RequestType::EndProgram => {
                write!(f, "{} END_PROGRAM: {}", self.sequence, self.string_param)
            }
            RequestType::Kill => write!(f, "{} KILL", self.sequence),
        }
    }
}

#[derive(Default)]
struct Completion {
    last_completed: RequestSequence,
    finished: HashMap<RequestSequence, Request>,
}

struct WorkerInner {
    shared: Arc<Shared>,
    queue: Mutex<VecDeque<Request>>,
    request_cv: Condvar,
    completion: Mutex<Completion>,
    completion_cv: Condvar,
}

/// The worker thread plus its request and completion plumbing
pub(crate) struct Worker {
    inner: Arc<WorkerInner>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread for a connection
    pub fn start(shared: Arc<Shared>) -> Worker {
        let inner = Arc::new(WorkerInner {
            shared,
            queue: Mutex::new(VecDeque::new()),
            request_cv: Condvar::new(),
            completion: Mutex::new(Completion::default()),
            completion_cv: Condvar::new(),
        });
        let run_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("dictsql-worker".to_string())
            .spawn(move || Worker::run(&run_inner))
            .ok();
        Worker { inner, thread }
    }

    /// Enqueue a request and wake the worker. Returns the sequence number
    /// assigned to the request.
    pub fn put_request(
        &self,
        rtype: RequestType,
        int_param: ExecutionHandle,
        string_param: &str,
    ) -> RequestSequence {
        let sequence;
        {
            let mut queue = self.inner.queue.lock();
            queue.push_front(Request::new(rtype, int_param, string_param));
            sequence = queue.front().map(|r| r.sequence).unwrap_or(0);
        }
        self.inner.request_cv.notify_one();
        sequence
    }

    /// Block until the given request has been processed and return its
    /// finalised form.
    pub fn wait_for_request(&self, sequence: RequestSequence) -> Request {
        let mut completion = self.inner.completion.lock();
        while completion.last_completed < sequence {
            self.inner.completion_cv.wait(&mut completion);
        }
        completion.finished.get(&sequence).cloned().unwrap_or_default()
    }

    /// Whether the given request has been processed
    pub fn is_completed(&self, sequence: RequestSequence) -> bool {
        self.inner.completion.lock().last_completed >= sequence
    }

    /// Stop the worker: enqueue a kill request and join the thread. Requests
    /// queued before the kill complete first. Idempotent.
    pub fn kill(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.put_request(RequestType::Kill, 0, "");
            let _ = handle.join();
        }
    }

    /// The worker loop. Blocks while the queue is empty; executions are
    /// cranked here, every other request type is a pure barrier.
    fn run(inner: &WorkerInner) {
        tracing::info!(conn = %inner.shared.name, "Execution thread running");
        let factory = inner.shared.driver.lock().factory();
        factory.thread_init();

        let mut running = true;
        while running {
            let mut request = Worker::get_request(inner);
            tracing::info!(conn = %inner.shared.name, "Received request {}", request);
            match request.rtype {
                RequestType::Execution => {
                    if let Some(cell) = inner.shared.find_execution(request.int_param) {
                        let mut execution = cell.inner.lock();
                        let ctx = ExecContext {
                            shared: &inner.shared,
                            worker: None,
                            on_worker: true,
                        };
                        execution.run_server_side(&ctx);
                        tracing::info!(
                            conn = %inner.shared.name,
                            execution = execution.handle(),
                            "Request {}: async execution complete",
                            request.sequence
                        );
                        request.rc = execution.return_code();
                        request.error_no = execution.error_no();
                        request.error_message = execution.error_message().to_string();
                    }
                }
                RequestType::None
                | RequestType::StartTransaction
                | RequestType::Commit
                | RequestType::Rollback
                | RequestType::StartProgram
                | RequestType::EndProgram => {}
                RequestType::Kill => running = false,
            }

            {
                let mut completion = inner.completion.lock();
                completion.last_completed = request.sequence;
                completion.finished.insert(request.sequence, request);
            }
            inner.completion_cv.notify_all();
        }

        factory.thread_end();
        tracing::info!(conn = %inner.shared.name, "Execution thread terminated");
    }

    /// Block until the queue is non-empty and pop from the back (FIFO).
    fn get_request(inner: &WorkerInner) -> Request {
        let mut queue = inner.queue.lock();
        loop {
            if let Some(request) = queue.pop_back() {
                return request;
            }
            inner.request_cv.wait(&mut queue);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill();
    }
}
