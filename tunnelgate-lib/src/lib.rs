use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{Arc, LazyLock, PoisonError, atomic::AtomicUsize},
};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    app::{inbound::InboundListener, session_table::SessionTable},
    config::def,
    proxy::utils::TcpDialer,
};

pub mod app;
pub mod config;

mod common;
pub mod proxy;
pub mod session;

pub use config::{RelayConfig, RuntimeConfig, def::Config as TunnelgateConfigDef};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

pub struct Options {
    pub config: Config,
    pub cwd: Option<String>,
    pub rt: Option<TokioRuntime>,
    pub log_file: Option<String>,
}

pub enum TokioRuntime {
    MultiThread,
    SingleThread,
}

pub enum Config {
    Def(TunnelgateConfigDef),
    Internal(RuntimeConfig),
    File(String),
    Str(String),
}

impl Config {
    pub fn try_parse(self) -> Result<RuntimeConfig> {
        match self {
            Config::Def(c) => c.try_into(),
            Config::Internal(c) => Ok(c),
            Config::File(file) => {
                TryInto::<def::Config>::try_into(PathBuf::from(file))?.try_into()
            }
            Config::Str(s) => s.parse::<def::Config>()?.try_into(),
        }
    }
}

#[derive(Default)]
pub struct RuntimeController {
    runtime_counter: AtomicUsize,
    shutdown_txs: HashMap<usize, mpsc::Sender<()>>,
}

impl RuntimeController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_runtime(&mut self, shutdown_tx: mpsc::Sender<()>) -> usize {
        let id = self
            .runtime_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.shutdown_txs.insert(id, shutdown_tx);
        id
    }

    pub fn unregister_runtime(&mut self, id: usize) {
        self.shutdown_txs.remove(&id);
    }
}

static RUNTIME_CONTROLLER: LazyLock<std::sync::Mutex<RuntimeController>> =
    LazyLock::new(|| std::sync::Mutex::new(RuntimeController::new()));

pub fn start_scaffold(opts: Options) -> Result<()> {
    let rt = match opts.rt.as_ref().unwrap_or(&TokioRuntime::MultiThread) {
        TokioRuntime::MultiThread => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?,
        TokioRuntime::SingleThread => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
    };
    let config: RuntimeConfig = opts.config.try_parse()?;
    let cwd = opts.cwd.unwrap_or_else(|| ".".to_string());

    app::logging::setup_logging(config.log_level, &cwd, opts.log_file);

    rt.block_on(async {
        match start(config).await {
            Err(e) => {
                eprintln!("start error: {e}");
                Err(e)
            }
            Ok(_) => Ok(()),
        }
    })
}

/// Asks every running instance to stop. Returns false if none is running.
pub fn shutdown() -> bool {
    let mut rt_ctrl = RUNTIME_CONTROLLER
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if rt_ctrl.shutdown_txs.is_empty() {
        return false;
    }
    rt_ctrl.shutdown_txs.clear();
    true
}

/// Runs the tunnel listener until ^C or [`shutdown`].
pub async fn start(config: RuntimeConfig) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let id = RUNTIME_CONTROLLER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .register_runtime(shutdown_tx);

    let cancel = CancellationToken::new();
    let dialer = Arc::new(TcpDialer::new(config.relay.dial_timeout));
    let listener = InboundListener::new(&config, dialer, SessionTable::new());

    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to listen for ^C event: {}", e);
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = shutdown_rx.recv() => info!("received shutdown signal"),
                _ = ctrl_c => info!("received ^C, shutting down"),
            }
            cancel.cancel();
        })
    };

    let result = listener.run(cancel).await;
    watcher.abort();
    RUNTIME_CONTROLLER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .unregister_runtime(id);

    result.map_err(|x| {
        error!("runtime error: {}, shutting down", x);
        x
    })
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use super::*;

    #[test]
    fn test_config_sources() {
        let c = Config::Str("listen: 127.0.0.1:9999".to_owned())
            .try_parse()
            .unwrap();
        assert_eq!(c.listen.port(), 9999);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "fallback: proxy.example.com-443").unwrap();
        let c = Config::File(file.path().to_string_lossy().into_owned())
            .try_parse()
            .unwrap();
        assert_eq!(
            c.relay.fallback,
            Some(session::TargetAddr::new("proxy.example.com", 443))
        );

        assert!(matches!(
            Config::File("/definitely/not/here.yaml".to_owned()).try_parse(),
            Err(Error::Io(_))
        ));
        assert!(matches!(
            Config::Str("dns-server: nowhere".to_owned()).try_parse(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let config = Config::Str("listen: 127.0.0.1:0".to_owned())
            .try_parse()
            .unwrap();
        let handle = tokio::spawn(start(config));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !shutdown() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("runtime never registered");

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
