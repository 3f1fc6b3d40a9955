//! A fixed pool of single-threaded cooperative reactors. Each session is
//! pinned to exactly one reactor for its lifetime, so session-local state
//! never needs cross-thread synchronization.
//!
//! The original scheduled work onto a `boost::asio::io_service` pool of OS
//! threads, each driving its own reactor loop. The natural Tokio analogue
//! kept here is one OS thread per reactor, each running its own
//! `current_thread` runtime; sessions are dispatched to a reactor via an
//! mpsc channel rather than the original's round-robin `io_service&`
//! reference handed to `PuttleProxy`'s constructor.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::session;
use crate::upstream::UpstreamList;

/// A handle to one running reactor thread: sending a socket down `tx`
/// hands it off to that reactor's runtime, which spawns a session task
/// for it.
pub struct Reactor {
    tx: mpsc::UnboundedSender<TcpStream>,
    _handle: std::thread::JoinHandle<()>,
}

impl Reactor {
    /// Spawns one OS thread running a `current_thread` Tokio runtime, which
    /// receives accepted sockets over a channel and runs one session task
    /// per socket.
    fn spawn(id: usize, upstreams: Arc<UpstreamList>) -> Reactor {
        let (tx, mut rx) = mpsc::unbounded_channel::<TcpStream>();

        let handle = std::thread::Builder::new()
            .name(format!("reactor-{id}"))
            .spawn(move || {
                let runtime = Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build reactor runtime");

                runtime.block_on(async move {
                    while let Some(client) = rx.recv().await {
                        let upstreams = Arc::clone(&upstreams);
                        tokio::spawn(async move {
                            if let Err(e) = session::run(client, &upstreams).await {
                                warn!(error = %e, "session ended with an error");
                            }
                        });
                    }
                });
            })
            .expect("failed to spawn reactor thread");

        Reactor {
            tx,
            _handle: handle,
        }
    }

    fn dispatch(&self, client: TcpStream) -> Result<(), TcpStream> {
        self.tx.send(client).map_err(|e| e.0)
    }
}

/// The pool of reactors the acceptor round-robins accepted sockets across.
pub struct ReactorPool {
    reactors: Vec<Reactor>,
    next: std::sync::atomic::AtomicUsize,
}

impl ReactorPool {
    /// Spawns `num_threads` reactor threads, each sharing the same
    /// read-only upstream list.
    pub fn new(num_threads: usize, upstreams: UpstreamList) -> ReactorPool {
        assert!(num_threads > 0, "reactor pool needs at least one thread");
        let upstreams = Arc::new(upstreams);
        let reactors = (0..num_threads)
            .map(|id| Reactor::spawn(id, Arc::clone(&upstreams)))
            .collect();

        ReactorPool {
            reactors,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Dispatches `client` to the next reactor in round-robin order.
    pub fn dispatch(&self, client: TcpStream) {
        let len = self.reactors.len();
        let idx = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % len;
        if let Err(_client) = self.reactors[idx].dispatch(client) {
            error!("reactor {idx} is no longer accepting sessions; dropping connection");
        }
    }
}
