use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::net::UnixListener;
use tokio::sync::watch;

use pdb_merge::MergeTree;
use pdb_server::{
    read_control_line, serve_head_lookup, serve_local_data_channel, serve_remote_data_channel,
    ControlMsg, RemoteChannelConfig,
};
use pdb_types::DbConfig;

// Startup exit codes, in failure order.
const EXIT_LOG_OPEN: i32 = 2;
const EXIT_DBROOT: i32 = 3;
const EXIT_STORE_OPEN: i32 = 9;

#[derive(clap::Parser, Debug)]
#[command(name = "pdb-node", about = "PerspectiveDB db node")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured dbroot.
    #[arg(long)]
    dbroot: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct LogConfig {
    level: String,
    format: String,
    #[serde(default)]
    file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Config {
    dbroot: PathBuf,
    log: LogConfig,
    #[serde(default)]
    dbs: Vec<DbConfig>,
}

fn init_logging(log: &LogConfig) {
    let file = log.file.as_ref().map(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => std::sync::Mutex::new(file),
            Err(e) => {
                eprintln!("cannot open log file {}: {e}", path.display());
                exit(EXIT_LOG_OPEN);
            }
        }
    });

    match (log.format.as_str(), file) {
        ("json", Some(file)) => tracing_subscriber::fmt()
            .json()
            .with_env_filter(&log.level)
            .with_writer(file)
            .init(),
        ("json", None) => tracing_subscriber::fmt()
            .json()
            .with_env_filter(&log.level)
            .init(),
        (_, Some(file)) => tracing_subscriber::fmt()
            .with_env_filter(&log.level)
            .with_ansi(false)
            .with_writer(file)
            .init(),
        (_, None) => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(&log.level)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment =
        Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));
    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }
    let mut config: Config = figment
        .merge(Env::prefixed("PERSPECTIVEDB_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    if let Some(dbroot) = cli.dbroot {
        config.dbroot = dbroot;
    }

    init_logging(&config.log);

    if let Err(e) = std::fs::create_dir_all(&config.dbroot) {
        tracing::error!(dbroot = %config.dbroot.display(), error = %e, "cannot create dbroot");
        exit(EXIT_DBROOT);
    }

    let (kill_tx, kill_rx) = watch::channel(false);
    let kill_tx = Arc::new(kill_tx);

    let mut dbs = Vec::new();
    for db in &config.dbs {
        let data_dir = config.dbroot.join(&db.name).join("data");
        if let Err(e) = std::fs::create_dir_all(&data_dir) {
            tracing::error!(db = %db.name, error = %e, "cannot create data directory");
            exit(EXIT_DBROOT);
        }
        let perspectives: Vec<String> = db.perspectives.iter().map(|p| p.name.clone()).collect();
        let mt = match MergeTree::open(&data_dir, db.merge_tree.clone(), &perspectives).await {
            Ok(mt) => mt,
            Err(e) => {
                tracing::error!(db = %db.name, error = %e, "cannot open store");
                exit(EXIT_STORE_OPEN);
            }
        };
        if db.perspectives.iter().any(|p| p.import) {
            mt.auto_merge()?;
        }
        tracing::info!(db = %db.name, perspectives = perspectives.len(), "db open");
        dbs.push((db.clone(), mt));
    }

    spawn_signal_handlers(&dbs);

    let mut servers = Vec::new();
    for (db, mt) in &dbs {
        let socket_path = config.dbroot.join(&db.name).join("sock");
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("cannot bind {}", socket_path.display()))?;
        tracing::info!(db = %db.name, socket = %socket_path.display(), "listening");
        servers.push(tokio::spawn(accept_loop(
            listener,
            db.clone(),
            mt.clone(),
            kill_tx.clone(),
        )));
    }

    // Shutdown is supervisor-driven: wait for a kill control message.
    let mut kill = kill_rx;
    while !*kill.borrow_and_update() {
        if kill.changed().await.is_err() {
            break;
        }
    }
    tracing::info!("kill received, draining");
    for server in &servers {
        server.abort();
    }
    for (_, mt) in &dbs {
        mt.close().await;
    }
    Ok(())
}

fn spawn_signal_handlers(dbs: &[(DbConfig, MergeTree)]) {
    use tokio::signal::unix::{signal, SignalKind};

    // SIGUSR2 dumps per-tree stats.
    let stat_dbs: Vec<(String, MergeTree)> = dbs
        .iter()
        .map(|(db, mt)| (db.name.clone(), mt.clone()))
        .collect();
    tokio::spawn(async move {
        let Ok(mut usr2) = signal(SignalKind::user_defined2()) else {
            return;
        };
        while usr2.recv().await.is_some() {
            for (name, mt) in &stat_dbs {
                match mt.stats().await {
                    Ok(stats) => {
                        let dump = serde_json::to_string(&stats).unwrap_or_default();
                        tracing::info!(db = %name, stats = %dump, "stats");
                    }
                    Err(e) => tracing::warn!(db = %name, error = %e, "stats failed"),
                }
            }
        }
    });

    // SIGTERM/SIGINT are ignored; the parent shuts us down via kill.
    tokio::spawn(async move {
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut int) = signal(SignalKind::interrupt()) else {
            return;
        };
        loop {
            tokio::select! {
                _ = term.recv() => tracing::debug!("ignoring SIGTERM"),
                _ = int.recv() => tracing::debug!("ignoring SIGINT"),
            }
        }
    });
}

async fn accept_loop(
    listener: UnixListener,
    db: DbConfig,
    mt: MergeTree,
    kill_tx: Arc<watch::Sender<bool>>,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(db = %db.name, error = %e, "accept failed");
                continue;
            }
        };
        let db = db.clone();
        let mt = mt.clone();
        let kill_tx = kill_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, db, mt, kill_tx).await {
                tracing::warn!(error = %e, "connection failed");
            }
        });
    }
}

async fn serve_connection(
    mut stream: tokio::net::UnixStream,
    db: DbConfig,
    mt: MergeTree,
    kill_tx: Arc<watch::Sender<bool>>,
) -> anyhow::Result<()> {
    let msg = read_control_line(&mut stream).await?;
    tracing::debug!(db = %db.name, msg = ?msg, "control message");
    match msg {
        ControlMsg::Init | ControlMsg::Listen => Ok(()),
        ControlMsg::HeadLookup => serve_head_lookup(stream, mt).await,
        ControlMsg::LocalDataChannel => serve_local_data_channel(stream, mt).await,
        ControlMsg::RemoteDataChannel {
            perspective,
            receive_before_send,
        } => {
            let Some(pe) = db.perspectives.iter().find(|p| p.name == perspective) else {
                anyhow::bail!("unknown perspective '{perspective}'");
            };
            serve_remote_data_channel(
                stream,
                mt,
                RemoteChannelConfig {
                    perspective,
                    import: pe.import,
                    export: pe.export,
                    receive_before_send,
                },
            )
            .await
        }
        ControlMsg::AutoMerge => {
            mt.auto_merge()?;
            Ok(())
        }
        ControlMsg::Kill => {
            kill_tx.send_replace(true);
            Ok(())
        }
    }
}
