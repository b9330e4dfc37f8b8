use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
    /// SIGUSR1, an explicit request to pause the run.
    Pause,
}

impl Signal {
    pub const ALL: [Signal; 4] = [
        Signal::Interrupt,
        Signal::Terminate,
        Signal::Hangup,
        Signal::Pause,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Hangup => "SIGHUP",
            Signal::Pause => "SIGUSR1",
        }
    }

    pub fn number(&self) -> i32 {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Hangup => libc::SIGHUP,
            Signal::Pause => libc::SIGUSR1,
        }
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, Signal::Pause)
    }

    pub fn exit_code(&self) -> i32 {
        128 + self.number()
    }
}

pub fn exit_code_for(name: &str) -> i32 {
    Signal::ALL
        .iter()
        .find(|s| s.name() == name)
        .map(Signal::exit_code)
        .unwrap_or(128 + libc::SIGTERM)
}

/// Background thread that turns termination signals into handler calls.
///
/// The handler runs on the listener thread; dropping the listener stops it.
pub struct SignalListener {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SignalListener {
    pub fn install<F>(handler: F) -> Result<Self>
    where
        F: Fn(Signal) + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::io::Result<()>>();

        let thread = thread::Builder::new()
            .name("piperun-signals".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let streams = (|| {
                        Ok::<_, std::io::Error>((
                            signal(SignalKind::interrupt())?,
                            signal(SignalKind::terminate())?,
                            signal(SignalKind::hangup())?,
                            signal(SignalKind::user_defined1())?,
                        ))
                    })();
                    let (mut int, mut term, mut hup, mut usr1) = match streams {
                        Ok(streams) => {
                            let _ = ready_tx.send(Ok(()));
                            streams
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };

                    loop {
                        let received = tokio::select! {
                            _ = int.recv() => Signal::Interrupt,
                            _ = term.recv() => Signal::Terminate,
                            _ = hup.recv() => Signal::Hangup,
                            _ = usr1.recv() => Signal::Pause,
                            _ = &mut shutdown_rx => break,
                        };
                        warn!(signal = received.name(), "Received signal");
                        handler(received);
                    }
                    debug!("Signal listener stopped");
                });
            })
            .map_err(|err| PipelineError::io("Failed to start signal listener", err))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(PipelineError::io("Failed to register signal handlers", err));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(PipelineError::io(
                    "Signal listener exited during startup",
                    std::io::Error::other("listener thread ended"),
                ));
            }
        }

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
