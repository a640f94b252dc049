// src/server.rs
use crate::auth::CredentialValidator;
use crate::config::ServerConfig;
use crate::conn::{Connection, Next, SharedContext};
use crate::error::ServerResult;
use crate::metrics::ServerMetrics;
use crate::syscalls::{self, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll, Waker};
use crate::table::{ConnectionTable, Entry, Token};
use crate::timer::HeapTimer;
use crate::worker::WorkerPool;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

const MAX_EVENTS: usize = 1024;
const BUSY_REPLY: &[u8] = b"Server busy!";

/// A worker's unit of work for one connection.
#[derive(Debug, Clone, Copy)]
struct Job {
    token: Token,
    kind: JobKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Process,
    Write,
}

/// Messages back to the reactor thread.
#[derive(Debug)]
enum Notice {
    /// A worker has handed the connection back.
    Done { token: Token, next: Next },
    /// The idle timer for the connection fired.
    Expired(Token),
}

/// Stops a running [`Server`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// The reactor: one thread owning the listener, epoll set, timer heap and
/// connection table, handing request work to a worker pool.
///
/// Connection descriptors are armed one-shot. Once an event is delivered the
/// connection belongs to whichever side handles it, and the reactor only
/// re-arms it after a worker reports back, so a connection is never touched
/// by two threads at once.
pub struct Server {
    config: ServerConfig,
    listen_fd: RawFd,
    local_addr: SocketAddr,
    epoll: Epoll,
    timer: HeapTimer<Token>,
    table: Arc<ConnectionTable<Connection>>,
    pool: WorkerPool<Job>,
    waker: Arc<Waker>,
    notices: Receiver<Notice>,
    notice_tx: Sender<Notice>,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<ServerMetrics>,
    conn_events: i32,
}

impl Server {
    pub fn bind(config: ServerConfig, validator: Arc<dyn CredentialValidator>) -> ServerResult<Self> {
        config.validate()?;
        let addr = config.server_addr()?;

        let listen_fd = syscalls::create_listen_socket(&addr, config.open_linger)?;
        // From here on `Drop` owns the listener.
        let partial = PartialServer { listen_fd };

        let local_addr = syscalls::local_addr(listen_fd)?;
        let epoll = Epoll::new(MAX_EVENTS)?;
        epoll.add(listen_fd, EPOLLIN | EPOLLRDHUP | EPOLLET)?;
        let waker = Arc::new(Waker::new()?);
        epoll.add(waker.read_fd(), EPOLLIN)?;

        let metrics = Arc::new(ServerMetrics::new());
        let table = Arc::new(ConnectionTable::with_capacity(config.max_connections.min(4096)));
        let ctx = Arc::new(SharedContext {
            root: config.root_dir.clone(),
            trigger: config.trigger_mode,
            validator,
            metrics: metrics.clone(),
        });
        let (notice_tx, notices) = mpsc::channel();

        let handler = {
            let table = table.clone();
            let tx = notice_tx.clone();
            let waker = waker.clone();
            move |job: Job| run_job(job, &table, &ctx, &tx, &waker)
        };
        let pool = if config.pin_workers {
            WorkerPool::pinned(config.workers, handler)?
        } else {
            WorkerPool::new(config.workers, handler)?
        };

        let mut conn_events = EPOLLRDHUP | EPOLLONESHOT;
        if config.trigger_mode.is_edge() {
            conn_events |= EPOLLET;
        }

        std::mem::forget(partial);
        tracing::info!(
            addr = %local_addr,
            trigger = ?config.trigger_mode,
            workers = pool.threads(),
            timeout_ms = config.timeout_ms,
            root = %config.root_dir.display(),
            "server listening"
        );

        Ok(Self {
            config,
            listen_fd,
            local_addr,
            epoll,
            timer: HeapTimer::with_capacity(1024),
            table,
            pool,
            waker,
            notices,
            notice_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics,
            conn_events,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Run the event loop until shut down.
    pub fn run(mut self) -> ServerResult<()> {
        let result = self.event_loop();
        self.close_all();
        let m = self.metrics.snapshot();
        tracing::info!(
            requests = m.req_count,
            bytes_sent = m.bytes_sent,
            timeouts = m.timeouts,
            "server stopped"
        );
        result
    }

    fn event_loop(&mut self) -> ServerResult<()> {
        while !self.shutdown.load(Ordering::Acquire) {
            let timeout_ms = self.timer.next_tick_ms();
            self.apply_notices();

            let n = self.epoll.wait(timeout_ms)?;
            for i in 0..n {
                let (fd, events) = self.epoll.ready(i);
                if fd == self.listen_fd {
                    self.accept_all();
                } else if fd == self.waker.read_fd() {
                    self.waker.drain();
                } else if events & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
                    if let Some(entry) = self.table.get(fd) {
                        self.close(&entry);
                    }
                } else if events & EPOLLIN as u32 != 0 {
                    self.handle_read(fd);
                } else if events & EPOLLOUT as u32 != 0 {
                    self.handle_write(fd);
                } else {
                    tracing::warn!(fd, events, "unexpected event");
                }
            }

            self.timer.tick();
            self.apply_notices();
        }
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, addr))) => self.add_client(fd, addr),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: SocketAddr) {
        if self.table.len() >= self.config.max_connections {
            let _ = syscalls::write_nonblocking(fd, BUSY_REPLY);
            syscalls::close_fd(fd);
            tracing::warn!(peer = %addr, "connection limit reached");
            return;
        }

        let entry = self.table.insert(fd, Connection::new(fd, addr));
        // Counted before registration so a failed `add` balances in `close`.
        let active = self.metrics.inc_conn();
        self.arm_timer(entry.token());
        if let Err(e) = self.epoll.add(fd, self.conn_events | EPOLLIN) {
            tracing::warn!(fd, error = %e, "failed to register connection");
            self.close(&entry);
            return;
        }
        tracing::info!(fd, peer = %addr, active, "client connected");
    }

    /// Start or restart the idle clock for `token`.
    fn arm_timer(&mut self, token: Token) {
        let tx = self.notice_tx.clone();
        self.timer.add(
            token,
            self.config.timeout(),
            Box::new(move || {
                let _ = tx.send(Notice::Expired(token));
            }),
        );
    }

    /// Reading happens here on the reactor; parsing and writing go to a worker.
    fn handle_read(&mut self, fd: RawFd) {
        let Some(entry) = self.table.get(fd) else {
            return;
        };
        self.timer.adjust(entry.token(), self.config.timeout());

        let res = entry.lock().read(self.config.trigger_mode);
        match res {
            Ok(0) => self.close(&entry),
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => {
                tracing::debug!(fd, error = %e, "read failed");
                self.close(&entry);
            }
            _ => self.dispatch(&entry, JobKind::Process),
        }
    }

    fn handle_write(&mut self, fd: RawFd) {
        let Some(entry) = self.table.get(fd) else {
            return;
        };
        self.timer.adjust(entry.token(), self.config.timeout());
        self.dispatch(&entry, JobKind::Write);
    }

    fn dispatch(&self, entry: &Entry<Connection>, kind: JobKind) {
        entry.set_busy(true);
        self.pool.submit(Job {
            token: entry.token(),
            kind,
        });
    }

    fn apply_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            match notice {
                Notice::Done { token, next } => self.on_done(token, next),
                Notice::Expired(token) => self.on_expired(token),
            }
        }
    }

    fn on_done(&mut self, token: Token, next: Next) {
        let Some(entry) = self.table.resolve(token) else {
            return;
        };
        entry.set_busy(false);
        if entry.take_close_pending() {
            self.close(&entry);
            return;
        }

        let interest = match next {
            Next::Read => EPOLLIN,
            Next::Write => EPOLLOUT,
            Next::Close => {
                self.close(&entry);
                return;
            }
        };
        if let Err(e) = self.epoll.modify(token.fd, self.conn_events | interest) {
            tracing::warn!(fd = token.fd, error = %e, "failed to re-arm connection");
            self.close(&entry);
            return;
        }
        self.arm_timer(token);
    }

    fn on_expired(&mut self, token: Token) {
        let Some(entry) = self.table.resolve(token) else {
            return;
        };
        self.metrics.inc_timeout();
        if entry.is_busy() {
            // The worker's report will close it.
            entry.defer_close();
            return;
        }
        tracing::debug!(fd = token.fd, "idle timeout");
        self.close(&entry);
    }

    /// Tear a connection down. Never called while a worker holds it.
    fn close(&mut self, entry: &Entry<Connection>) {
        let token = entry.token();
        if self.table.remove(token).is_none() {
            return;
        }
        self.timer.cancel(token);
        if let Err(e) = self.epoll.delete(token.fd) {
            tracing::debug!(fd = token.fd, error = %e, "epoll delete failed");
        }
        let active = self.metrics.dec_conn();
        entry.lock().close();
        tracing::info!(fd = token.fd, active, "client closed");
    }

    fn close_all(&mut self) {
        // Let in-flight jobs finish before their connections go away.
        self.pool.shutdown();
        self.apply_notices();
        for entry in self.table.drain() {
            self.timer.cancel(entry.token());
            let _ = self.epoll.delete(entry.token().fd);
            self.metrics.dec_conn();
            entry.lock().close();
        }
        self.timer.clear();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
    }
}

/// Closes the listener if `bind` bails out before a `Server` exists.
struct PartialServer {
    listen_fd: RawFd,
}

impl Drop for PartialServer {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
    }
}

fn run_job(
    job: Job,
    table: &ConnectionTable<Connection>,
    ctx: &SharedContext,
    tx: &Sender<Notice>,
    waker: &Waker,
) {
    let Some(entry) = table.resolve(job.token) else {
        return;
    };
    let next = {
        let mut conn = entry.lock();
        match job.kind {
            JobKind::Process => conn.on_process(ctx),
            JobKind::Write => conn.on_write(ctx),
        }
    };
    if tx.send(Notice::Done { token: job.token, next }).is_ok() {
        waker.wake();
    }
}
