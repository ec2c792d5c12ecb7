//! The multiplexer thread.
//!
//! [`NetRuntime::start`] spawns a dedicated thread running a current-thread
//! tokio runtime inside a `LocalSet`: the setup future builds listeners and
//! connections there, then the multiplexer polls until shutdown. All other
//! threads interact through the thread-safe handles
//! ([`MultiplexerHandle`], `EndpointHandle`, proxies, mailboxes).

use std::rc::Rc;

use tokio::sync::oneshot;

use crate::error::NetError;
use crate::multiplexer::{Multiplexer, MultiplexerHandle};

/// Owns the multiplexer thread.
pub struct NetRuntime {
    handle: MultiplexerHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl NetRuntime {
    /// Spawn the multiplexer thread and run `setup` on it before polling
    /// starts. `setup` typically dials peers or binds listeners via the
    /// backend modules.
    pub fn start<F, Fut>(setup: F) -> Result<Self, NetError>
    where
        F: FnOnce(Rc<Multiplexer>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), NetError>> + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<MultiplexerHandle, NetError>>();
        let thread = std::thread::Builder::new()
            .name("tidepool-mpx".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(NetError::Io(err)));
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    let mpx = Multiplexer::new();
                    mpx.set_thread_id();
                    match setup(mpx.clone()).await {
                        Ok(()) => {
                            if ready_tx.send(Ok(mpx.handle())).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    }
                    mpx.run().await;
                    tracing::debug!("multiplexer loop finished");
                });
            })
            .map_err(NetError::Io)?;
        let handle = ready_rx
            .blocking_recv()
            .map_err(|_| NetError::runtime("multiplexer thread died during setup"))??;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Thread-safe handle to the running multiplexer.
    pub fn handle(&self) -> MultiplexerHandle {
        self.handle.clone()
    }

    /// Shut the multiplexer down and join its thread.
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            if thread.join().is_err() {
                tracing::error!("multiplexer thread panicked");
            }
        }
    }
}

impl Drop for NetRuntime {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}
