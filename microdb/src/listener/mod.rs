use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::handler::Handler;
use crate::protocol;
use crate::{net, ServiceError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ServiceConfig {
    pub record_path: PathBuf,
    /// N: clients served concurrently.
    pub max_handlers: usize,
    /// M: capacity of the application waiting queue; also the kernel
    /// listen backlog.
    pub max_waiting: usize,
    pub poll_interval: Duration,
}

impl ServiceConfig {
    pub fn new(record_path: impl Into<PathBuf>, max_handlers: usize, max_waiting: usize) -> Self {
        ServiceConfig {
            record_path: record_path.into(),
            max_handlers,
            max_waiting,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

fn send_line(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    stream.write_all(message.as_bytes())?;
    stream.write_all(b"\n")
}

/// The accept/admission loop. Admits a connection while a handler slot is
/// free, queues it while the waiting queue has room, refuses it otherwise;
/// queued clients move to handlers strictly FIFO.
pub struct Listener {
    listener: TcpListener,
    cfg: ServiceConfig,
    active: Vec<JoinHandle<()>>,
    waiting: VecDeque<TcpStream>,
}

impl Listener {
    pub fn bind(port: u16, cfg: ServiceConfig) -> Result<Listener, ServiceError> {
        let listener = net::bind_with_backlog(port, cfg.max_waiting as i32)?;
        listener.set_nonblocking(true)?;
        Ok(Listener {
            listener,
            cfg,
            active: Vec::new(),
            waiting: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until `shutdown` is raised. On the way out, queued clients are
    /// refused and live handlers are joined.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), ServiceError> {
        info!(
            addr = %self.local_addr()?,
            max_handlers = self.cfg.max_handlers,
            max_waiting = self.cfg.max_waiting,
            "listening"
        );
        while !shutdown.load(Ordering::SeqCst) {
            self.reap();
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => warn!(error = %e, "accept failed"),
            }
            self.drain();
            thread::sleep(self.cfg.poll_interval);
        }

        info!("listener shutting down");
        for mut stream in self.waiting.drain(..) {
            let _ = send_line(&mut stream, protocol::REFUSED);
        }
        for handle in self.active.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Join-on-exit reaping: finished handler threads leave the active set
    /// before admission decisions are made.
    fn reap(&mut self) {
        if self.active.iter().all(|h| !h.is_finished()) {
            return;
        }
        let (finished, live): (Vec<_>, Vec<_>) =
            self.active.drain(..).partition(|h| h.is_finished());
        for handle in finished {
            if handle.join().is_err() {
                warn!("handler thread panicked");
            }
        }
        self.active = live;
        info!(active = self.active.len(), "handler exited");
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        // Accepted sockets must block regardless of what they inherit
        // from the non-blocking listener.
        let _ = stream.set_nonblocking(false);
        if self.active.len() < self.cfg.max_handlers {
            info!(%peer, "client admitted");
            if send_line(&mut stream, protocol::READY).is_ok() {
                self.spawn_handler(stream);
            }
        } else if self.waiting.len() < self.cfg.max_waiting {
            let position = self.waiting.len() + 1;
            info!(%peer, position, "client queued");
            if send_line(&mut stream, &protocol::queued_notice(position)).is_ok() {
                self.waiting.push_back(stream);
            }
        } else {
            info!(%peer, "client refused");
            let _ = send_line(&mut stream, protocol::REFUSED);
        }
    }

    fn drain(&mut self) {
        while self.active.len() < self.cfg.max_handlers {
            let Some(mut stream) = self.waiting.pop_front() else {
                break;
            };
            if send_line(&mut stream, protocol::YOUR_TURN).is_err() {
                // The client gave up while queued; its slot goes to the next.
                continue;
            }
            info!(peer = ?stream.peer_addr().ok(), "queued client promoted");
            self.spawn_handler(stream);
        }
    }

    fn spawn_handler(&mut self, stream: TcpStream) {
        let handler = match Handler::start(stream, &self.cfg.record_path) {
            Ok(handler) => handler,
            Err(e) => {
                error!(error = %e, "handler setup failed");
                return;
            }
        };
        let spawned = thread::Builder::new()
            .name("microdb-handler".to_string())
            .spawn(move || {
                if let Err(e) = handler.run() {
                    error!(error = %e, "handler failed");
                }
            });
        match spawned {
            Ok(handle) => self.active.push(handle),
            Err(e) => error!(error = %e, "failed to spawn handler thread"),
        }
    }
}
