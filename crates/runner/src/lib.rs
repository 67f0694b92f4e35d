//! Process supervisor for long-running services.
//!
//! Named app processes run concurrently on a shared cancellation token.
//! SIGINT or SIGTERM cancels the token, and so does the first process that
//! fails. Once every process has stopped, the closers run concurrently under
//! a timeout.
//!
//! # Example
//!
//! ```no_run
//! use ingest_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_named_process("ticker", |ctx| async move {
//!             loop {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => break,
//!                     _ = tokio::time::sleep(Duration::from_secs(1)) => {
//!                         tracing::info!("tick");
//!                     }
//!                 }
//!             }
//!             Ok(())
//!         })
//!         .with_closer(|| async move {
//!             tracing::info!("cleaning up");
//!             Ok(())
//!         })
//!         .with_closer_timeout(Duration::from_secs(5))
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type BoxFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;

/// An app process: takes the shared cancellation token and runs until it fires
pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> BoxFuture + Send>;

/// A cleanup function run after every process has stopped
pub type Closer = Box<dyn FnOnce() -> BoxFuture + Send>;

/// How a run ended
#[derive(Debug)]
pub struct RunOutcome {
    /// Name and error of the first process that failed, if any
    pub first_error: Option<(String, anyhow::Error)>,
    /// Whether the closers finished inside the timeout
    pub closers_completed: bool,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.first_error.is_some() {
            1
        } else {
            0
        }
    }
}

pub struct Runner {
    app_processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// A runner with no processes and a 10 second closer timeout
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Add a process; `name` identifies it in logs and in `RunOutcome`
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.app_processes.push((
            name.into(),
            Box::new(move |token| -> BoxFuture { Box::pin(process(token)) }),
        ));
        self
    }

    /// Add a closer. Closers run after every process has stopped, whatever
    /// the reason; one failing does not stop the others.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.closers
            .push(Box::new(move || -> BoxFuture { Box::pin(closer()) }));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Use an externally owned token, e.g. to stop the runner from a test
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Run to completion and exit the process with the resulting code
    pub async fn run(self) {
        spawn_signal_handlers(self.cancellation_token.clone());

        let outcome = self.run_until_stopped().await;
        match &outcome.first_error {
            Some((name, err)) => {
                tracing::error!(process = %name, "Application exiting with error: {:#}", err);
            }
            None => tracing::info!("Application exiting normally"),
        }
        std::process::exit(outcome.exit_code());
    }

    /// Run every process until all have stopped, then run the closers.
    ///
    /// Does not install signal handlers; cancellation comes from the token
    /// or from a failing process.
    pub async fn run_until_stopped(self) -> RunOutcome {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for (name, process) in self.app_processes {
            let process_token = token.clone();
            tracing::info!(process = %name, "Starting process");
            join_set.spawn(async move { (name, process(process_token).await) });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::info!(process = %name, "Process stopped");
                }
                Ok((name, Err(err))) => {
                    tracing::error!(process = %name, "Process failed: {:#}", err);
                    if first_error.is_none() {
                        first_error = Some((name, err));
                    }
                    token.cancel();
                }
                Err(err) => {
                    tracing::error!("Process panicked: {}", err);
                    if first_error.is_none() {
                        first_error = Some(("unknown".to_string(), anyhow::anyhow!("{}", err)));
                    }
                    token.cancel();
                }
            }
        }

        let closers_completed = run_closers(self.closers, self.closer_timeout).await;

        RunOutcome {
            first_error,
            closers_completed,
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received SIGINT, shutting down");
                ctrl_c_token.cancel();
            }
            Err(err) => {
                tracing::error!("Error setting up SIGINT handler: {}", err);
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM, shutting down");
                token.cancel();
            }
            Err(err) => {
                tracing::error!("Error setting up SIGTERM handler: {}", err);
            }
        }
    });
}

/// Run closers concurrently; false if they did not finish within `timeout`
async fn run_closers(closers: Vec<Closer>, timeout: Duration) -> bool {
    if closers.is_empty() {
        return true;
    }

    tracing::info!("Running closers with timeout of {:?}", timeout);
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(closer());
    }

    let all_done = async {
        while let Some(result) = closer_set.join_next().await {
            match result {
                Ok(Ok(())) => tracing::debug!("Closer completed successfully"),
                Ok(Err(err)) => tracing::error!("Closer error: {:#}", err),
                Err(err) => tracing::error!("Closer panicked: {}", err),
            }
        }
    };

    match tokio::time::timeout(timeout, all_done).await {
        Ok(()) => {
            tracing::info!("All closers completed");
            true
        }
        Err(_) => {
            tracing::error!("Closers timed out after {:?}", timeout);
            false
        }
    }
}
