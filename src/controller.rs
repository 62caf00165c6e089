//! Main controller: owns the listeners, the active worker pool and the
//! statistics task, and drives startup, reload and shutdown.
//!
//! Reload reconciles desired against running state: the thread pool is
//! replaced only when its limits changed, a process pool is always
//! recreated (workers capture configuration at spawn), and listeners are
//! diffed by port so unchanged ports keep their instance.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::addrcheck;
use crate::config::{Config, ConfigVar};
use crate::plugins::{self, Plugin};
use crate::procpool::{ProcPool, ProcPoolOptions};
use crate::server::PolicyServer;
use crate::session::{run_plugins, SessionHandler};
use crate::stats::StatsKeeper;
use crate::suspect::{Suspect, Verdict};
use crate::threadpool::ThreadPool;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

static CORE_REQUIRED_VARS: &[ConfigVar] = &[
    ConfigVar {
        name: "identifier",
        section: Some("main"),
        description: "any string that helps you identify this configuration; printed on reload",
        default: "dist",
        validator: None,
    },
    ConfigVar {
        name: "daemonize",
        section: Some("main"),
        description: "run as a daemon? (handled by the service wrapper)",
        default: "1",
        validator: None,
    },
    ConfigVar {
        name: "user",
        section: Some("main"),
        description: "run as user",
        default: "nobody",
        validator: None,
    },
    ConfigVar {
        name: "group",
        section: Some("main"),
        description: "run as group",
        default: "nobody",
        validator: None,
    },
    ConfigVar {
        name: "plugindir",
        section: Some("main"),
        description: "reserved: plugins resolve through the built-in registry",
        default: "",
        validator: None,
    },
    ConfigVar {
        name: "plugins",
        section: Some("main"),
        description: "plugins to run, comma separated; entries may override their section as name(section)",
        default: "",
        validator: None,
    },
    ConfigVar {
        name: "bindaddress",
        section: Some("main"),
        description: "address to listen on, usually 127.0.0.1 so only local connections are accepted",
        default: "127.0.0.1",
        validator: None,
    },
    ConfigVar {
        name: "incomingport",
        section: Some("main"),
        description: "incoming ports, whitespace separated; a port may carry its own chain as port:plugin,plugin",
        default: "9998",
        validator: None,
    },
    ConfigVar {
        name: "address_compliance_checker",
        section: Some("main"),
        description: "method to check mail address validity (\"Default\", \"LazyLocalPart\")",
        default: "Default",
        validator: None,
    },
    ConfigVar {
        name: "address_compliance_fail_action",
        section: Some("main"),
        description: "action if the address validity check fails (\"defer\", \"reject\", \"discard\")",
        default: "defer",
        validator: None,
    },
    ConfigVar {
        name: "address_compliance_fail_message",
        section: Some("main"),
        description: "reply message if the address validity check fails",
        default: "invalid sender or recipient address",
        validator: None,
    },
    ConfigVar {
        name: "minthreads",
        section: Some("performance"),
        description: "minimum scanner threads",
        default: "2",
        validator: Some(|v| v.parse::<usize>().is_ok()),
    },
    ConfigVar {
        name: "maxthreads",
        section: Some("performance"),
        description: "maximum scanner threads",
        default: "40",
        validator: Some(|v| v.parse::<usize>().is_ok()),
    },
    ConfigVar {
        name: "backend",
        section: Some("performance"),
        description: "method for parallelism, either 'thread' or 'process'",
        default: "thread",
        validator: Some(|v| v == "thread" || v == "process"),
    },
    ConfigVar {
        name: "initialprocs",
        section: Some("performance"),
        description: "worker process count when backend='process'; 0 selects twice the logical cores",
        default: "0",
        validator: Some(|v| v.parse::<usize>().is_ok()),
    },
    ConfigVar {
        name: "queuesize",
        section: Some("performance"),
        description: "process backend task queue capacity",
        default: "100",
        validator: Some(|v| v.parse::<usize>().is_ok()),
    },
    ConfigVar {
        name: "static",
        section: Some("PluginAlias"),
        description: "alias for the bundled static response plugin",
        default: "postguard.plugins.StaticResponse",
        validator: None,
    },
];

/// Core configuration options and their defaults.
pub fn core_required_vars() -> &'static [ConfigVar] {
    CORE_REQUIRED_VARS
}

/// One `incomingport` token: a port, optionally with its own plugin chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub port: u16,
    pub chain: Option<String>,
}

/// Parse the whitespace-separated `incomingport` value.
pub fn parse_incoming_ports(raw: &str) -> anyhow::Result<Vec<PortBinding>> {
    let mut bindings = Vec::new();
    for token in raw.split_whitespace() {
        let (port, chain) = match token.split_once(':') {
            Some((port, chain)) => (port, Some(chain.to_string())),
            None => (token, None),
        };
        let port = port
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid incomingport entry '{token}'"))?;
        bindings.push(PortBinding { port, chain });
    }
    Ok(bindings)
}

/// The concurrency substrate currently in service. `Inline` runs sessions
/// directly on the accept task; it is the state before startup and the
/// fallback used by `test`.
pub enum PoolBackend {
    Inline,
    Thread(ThreadPool),
    Process(ProcPool),
}

/// Shared, swappable view of the active pool. Listeners dispatch through
/// it; the controller replaces the backend on reload.
pub struct ActivePool {
    stats: Arc<StatsKeeper>,
    backend: RwLock<PoolBackend>,
}

impl ActivePool {
    pub fn new(stats: Arc<StatsKeeper>) -> Self {
        ActivePool {
            stats,
            backend: RwLock::new(PoolBackend::Inline),
        }
    }

    pub async fn dispatch(
        &self,
        stream: TcpStream,
        config: Arc<Config>,
        plugins: Arc<Vec<Arc<dyn Plugin>>>,
    ) {
        let backend = self.backend.read().await;
        match &*backend {
            PoolBackend::Inline => {
                let outcome = SessionHandler::new(stream, config, plugins).handle().await;
                self.stats.record(&outcome);
            }
            PoolBackend::Thread(pool) => {
                pool.add_task(SessionHandler::new(stream, config, plugins))
                    .await;
            }
            PoolBackend::Process(pool) => {
                // workers manage configuration and plugins themselves; only
                // the socket crosses the process boundary
                pool.add_task(stream).await;
            }
        }
    }

    /// Install a new backend, returning the previous one for teardown.
    pub async fn replace(&self, backend: PoolBackend) -> PoolBackend {
        std::mem::replace(&mut *self.backend.write().await, backend)
    }

    /// Current thread-pool limits, if the thread backend is active.
    pub async fn thread_limits(&self) -> Option<(usize, usize)> {
        match &*self.backend.read().await {
            PoolBackend::Thread(pool) => Some((pool.min_threads(), pool.max_threads())),
            _ => None,
        }
    }

    pub async fn is_process(&self) -> bool {
        matches!(&*self.backend.read().await, PoolBackend::Process(_))
    }
}

async fn shutdown_backend(backend: PoolBackend) {
    match backend {
        PoolBackend::Inline => {}
        PoolBackend::Thread(pool) => pool.shutdown().await,
        PoolBackend::Process(pool) => pool.shutdown().await,
    }
}

pub struct MainController {
    config: Config,
    frozen: Arc<Config>,
    config_path: Option<PathBuf>,
    plugins: Arc<Vec<Arc<dyn Plugin>>>,
    servers: Vec<PolicyServer>,
    pool: Arc<ActivePool>,
    stats: Arc<StatsKeeper>,
    stats_task: Option<(CancellationToken, JoinHandle<()>)>,
    pub started: DateTime<Utc>,
}

impl MainController {
    /// Build a controller around a configuration. Core defaults are
    /// propagated immediately so every later read finds its option.
    pub fn new(mut config: Config, config_path: Option<PathBuf>) -> Self {
        config.propagate_defaults(core_required_vars(), "main");
        let frozen = Arc::new(config.clone());
        let stats = Arc::new(StatsKeeper::new());
        MainController {
            config,
            frozen,
            config_path,
            plugins: Arc::new(Vec::new()),
            servers: Vec::new(),
            pool: Arc::new(ActivePool::new(Arc::clone(&stats))),
            stats,
            stats_task: None,
            started: Utc::now(),
        }
    }

    /// Load the configured plugin chain. On success the chain replaces the
    /// previous one and plugin defaults are propagated; on failure nothing
    /// changes and `false` is returned.
    pub fn load_plugins(&mut self) -> bool {
        tracing::debug!("loading scanner plugins");
        let spec = self
            .config
            .get("main", "plugins")
            .unwrap_or("")
            .to_string();
        let (loaded, all_ok) = plugins::load_all(&self.config, &spec);
        if all_ok {
            self.plugins = Arc::new(loaded);
            plugins::propagate_plugin_defaults(&mut self.config, &self.plugins);
            self.frozen = Arc::new(self.config.clone());
        }
        all_ok
    }

    pub async fn startup(&mut self) -> anyhow::Result<()> {
        addrcheck::install(
            self.config
                .get("main", "address_compliance_checker")
                .unwrap_or("Default"),
        );
        if !self.load_plugins() {
            bail!("some plugins failed to load, please check the logs");
        }

        self.start_stats_task();

        let backend = self
            .config
            .get("performance", "backend")
            .unwrap_or("thread")
            .to_string();
        match backend.as_str() {
            "thread" => {
                let pool = self.start_threadpool();
                self.pool.replace(PoolBackend::Thread(pool)).await;
            }
            "process" => {
                let pool = self.start_procpool().await?;
                self.pool.replace(PoolBackend::Process(pool)).await;
            }
            other => bail!(
                "'{other}' not allowed for backend, valid options are \"thread\" and \"process\""
            ),
        }

        let ports = self.config.get("main", "incomingport").unwrap_or("");
        for binding in parse_incoming_ports(ports)? {
            let chain = match &binding.chain {
                Some(spec) => {
                    let (list, all_ok) = plugins::load_all(&self.config, spec);
                    if !all_ok {
                        tracing::error!(
                            port = binding.port,
                            "could not start engine on port, some plugins failed to load"
                        );
                        continue;
                    }
                    Arc::new(list)
                }
                None => Arc::clone(&self.plugins),
            };
            let server = self.start_server(binding.port, chain).await?;
            self.servers.push(server);
        }
        tracing::info!("startup complete");
        Ok(())
    }

    /// Apply configuration changes: swap pools where needed and reconcile
    /// the set of listening ports. The default plugin chain is kept.
    pub async fn reload(&mut self, mut new_config: Config) {
        new_config.propagate_defaults(core_required_vars(), "main");
        tracing::info!(
            identifier = new_config.get("main", "identifier").unwrap_or("dist"),
            "applying configuration changes"
        );
        self.config = new_config;
        plugins::propagate_plugin_defaults(&mut self.config, &self.plugins);
        self.frozen = Arc::new(self.config.clone());

        let backend = self
            .config
            .get("performance", "backend")
            .unwrap_or("thread")
            .to_string();
        match backend.as_str() {
            "thread" => {
                let min = self.threadpool_limit("minthreads", 1);
                let max = self.threadpool_limit("maxthreads", 3);
                match self.pool.thread_limits().await {
                    Some((cur_min, cur_max)) if (cur_min, cur_max) == (min, max) => {
                        tracing::info!("keeping existing thread pool");
                    }
                    Some(_) => {
                        tracing::info!("thread pool config changed, initialising new thread pool");
                        let pool = self.start_threadpool();
                        let old = self.pool.replace(PoolBackend::Thread(pool)).await;
                        shutdown_backend(old).await;
                    }
                    None => {
                        tracing::info!("creating new thread pool");
                        let pool = self.start_threadpool();
                        let old = self.pool.replace(PoolBackend::Thread(pool)).await;
                        shutdown_backend(old).await;
                    }
                }
            }
            "process" => {
                // always recreated: workers capture configuration at spawn
                tracing::info!("creating new process pool");
                match self.start_procpool().await {
                    Ok(pool) => {
                        let old = self.pool.replace(PoolBackend::Process(pool)).await;
                        shutdown_backend(old).await;
                    }
                    Err(err) => {
                        tracing::error!(%err, "could not create process pool, keeping previous backend");
                    }
                }
            }
            other => {
                tracing::error!(
                    backend = other,
                    "backend not detected, ignoring (valid options \"thread\" and \"process\")"
                );
            }
        }

        let ports = self.config.get("main", "incomingport").unwrap_or("");
        let bindings = match parse_incoming_ports(ports) {
            Ok(bindings) => bindings,
            Err(err) => {
                tracing::error!(%err, "invalid incomingport configuration, keeping current listeners");
                return;
            }
        };

        for binding in &bindings {
            if self.servers.iter().any(|s| s.port() == binding.port) {
                tracing::debug!(port = binding.port, "keeping existing policy server");
                continue;
            }
            tracing::info!(port = binding.port, "starting new policy server");
            let chain = match &binding.chain {
                Some(spec) => {
                    let (list, all_ok) = plugins::load_all(&self.config, spec);
                    if !all_ok {
                        tracing::error!(
                            port = binding.port,
                            "could not start engine on port, some plugins failed to load"
                        );
                        continue;
                    }
                    Arc::new(list)
                }
                None => Arc::clone(&self.plugins),
            };
            match self.start_server(binding.port, chain).await {
                Ok(server) => self.servers.push(server),
                Err(err) => tracing::error!(port = binding.port, %err, "could not start policy server"),
            }
        }

        let keep: Vec<u16> = bindings.iter().map(|b| b.port).collect();
        let mut kept = Vec::new();
        for server in self.servers.drain(..) {
            if keep.contains(&server.port()) {
                tracing::info!(port = server.port(), "keeping server socket");
                kept.push(server);
            } else {
                tracing::info!(port = server.port(), "closing server socket");
                server.shutdown().await;
            }
        }
        self.servers = kept;
        tracing::info!("config changes applied");
    }

    pub async fn shutdown(&mut self) {
        if let Some((cancel, handle)) = self.stats_task.take() {
            cancel.cancel();
            let _ = handle.await;
        }
        for server in self.servers.drain(..) {
            tracing::info!(port = server.port(), "closing server socket");
            server.shutdown().await;
        }
        let old = self.pool.replace(PoolBackend::Inline).await;
        shutdown_backend(old).await;
        tracing::info!("shutdown complete");
    }

    /// Dry-run without Postfix: build a suspect from the given attributes
    /// and run it through the chain configured for `port` (or the default
    /// chain).
    pub async fn test_run(
        &mut self,
        values: IndexMap<String, String>,
        port: Option<u16>,
    ) -> anyhow::Result<Verdict> {
        if !self.load_plugins() {
            bail!("some plugins failed to load, please check the logs");
        }
        let chain = match port {
            None => Arc::clone(&self.plugins),
            Some(port) => {
                let ports = self.config.get("main", "incomingport").unwrap_or("");
                let bindings = parse_incoming_ports(ports)?;
                let binding = bindings
                    .iter()
                    .find(|b| b.port == port)
                    .ok_or_else(|| anyhow!("no plugin configuration for current port selection"))?;
                match &binding.chain {
                    Some(spec) => {
                        let (list, all_ok) = plugins::load_all(&self.config, spec);
                        if !all_ok {
                            bail!("some plugins failed to load, please check the logs");
                        }
                        Arc::new(list)
                    }
                    None => Arc::clone(&self.plugins),
                }
            }
        };
        let mut suspect = Suspect::new(values);
        Ok(run_plugins(&mut suspect, &chain, &self.frozen).await)
    }

    /// Check the core configuration and every plugin's self-test. Returns
    /// the number of failures; plugin load failure counts as one.
    pub fn lint(&mut self) -> usize {
        let mut errors = 0;
        println!("Loading plugins...");
        if !self.load_plugins() {
            println!("At least one plugin failed to load");
            errors += 1;
        }
        println!("Plugin loading complete");

        println!("Linting main configuration");
        if self.config.check_vars(core_required_vars(), "main") {
            println!("OK");
        } else {
            println!("ERROR");
            errors += 1;
        }

        let chain = Arc::clone(&self.plugins);
        for plugin in chain.iter() {
            println!();
            println!(
                "Linting plugin {} config section: {}",
                plugin.name(),
                plugin.section()
            );
            if plugin.lint(&self.config) {
                println!("OK");
            } else {
                println!("ERROR");
                errors += 1;
            }
        }
        println!("{errors} checks reported errors.");
        errors
    }

    pub fn servers(&self) -> &[PolicyServer] {
        &self.servers
    }

    pub fn active_pool(&self) -> Arc<ActivePool> {
        Arc::clone(&self.pool)
    }

    pub fn stats(&self) -> Arc<StatsKeeper> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.frozen)
    }

    pub fn plugins(&self) -> Arc<Vec<Arc<dyn Plugin>>> {
        Arc::clone(&self.plugins)
    }

    fn start_stats_task(&mut self) {
        tracing::info!("starting stats engine");
        let stats = Arc::clone(&self.stats);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => stats.log_summary(),
                }
            }
        });
        self.stats_task = Some((cancel, handle));
    }

    fn threadpool_limit(&self, option: &str, fallback: usize) -> usize {
        match self.config.get_int::<usize>("performance", option) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%err, "performance section not usable, using default thread numbers");
                fallback
            }
        }
    }

    fn start_threadpool(&self) -> ThreadPool {
        let min = self.threadpool_limit("minthreads", 1);
        let max = self.threadpool_limit("maxthreads", 3);
        ThreadPool::start(min, max, Arc::clone(&self.stats))
    }

    async fn start_procpool(&self) -> anyhow::Result<ProcPool> {
        let configured: usize = self
            .config
            .get_int("performance", "initialprocs")
            .unwrap_or(0);
        let numprocs = if configured < 1 {
            2 * std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            configured
        };
        let queuesize: usize = self
            .config
            .get_int("performance", "queuesize")
            .unwrap_or(crate::procpool::DEFAULT_QUEUE_SIZE);
        let config_path = self
            .config_path
            .clone()
            .ok_or_else(|| anyhow!("process backend requires a configuration file path"))?;
        ProcPool::start(
            ProcPoolOptions {
                numprocs,
                queuesize,
                config_path,
                worker_exe: None,
            },
            Arc::clone(&self.stats),
        )
        .await
    }

    async fn start_server(
        &self,
        port: u16,
        chain: Arc<Vec<Arc<dyn Plugin>>>,
    ) -> anyhow::Result<PolicyServer> {
        let address = self
            .config
            .get("main", "bindaddress")
            .unwrap_or("127.0.0.1")
            .to_string();
        PolicyServer::start(
            &address,
            port,
            Arc::clone(&self.frozen),
            chain,
            Arc::clone(&self.pool),
        )
        .await
    }
}
