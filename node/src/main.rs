use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use config::{Config, File as ConfigFile};
use pinledger_pinning::{PinService, PinataClient, PinataConfig, StubPinService};
use pinledger_registry::{
    Address, FileRegistry, LedgerStore, MemoryLedgerStore, SledLedgerStore,
};
use pinledger_rpc::{start_server, AppState};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod version;

use version::{git_commit_hash, PINLEDGER_VERSION};

const DEFAULT_CONFIG_PATH: &str = "config/pinledger.toml";
const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreMode {
    Sled,
    Memory,
}

impl StoreMode {
    fn from_env(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "memory" | "mem" => StoreMode::Memory,
            _ => StoreMode::Sled,
        }
    }
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            StoreMode::Sled => "sled",
            StoreMode::Memory => "memory",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinBackend {
    Stub,
    Pinata,
}

impl PinBackend {
    fn from_env(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "pinata" => PinBackend::Pinata,
            _ => PinBackend::Stub,
        }
    }
}

impl fmt::Display for PinBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            PinBackend::Stub => "stub",
            PinBackend::Pinata => "pinata",
        };
        f.write_str(value)
    }
}

/// Application configuration
#[derive(Debug, Clone)]
struct AppConfig {
    config_path: Option<PathBuf>,
    node_id: String,

    // Registry
    owner: Option<Address>,

    // Network
    rpc_host: String,
    rpc_port: u16,
    rpc_allowed_origins: Vec<String>,

    // Storage
    data_dir: PathBuf,
    store: StoreMode,

    // Pinning
    pin_backend: PinBackend,
    pinata_jwt: Option<String>,
    pinata_api_key: Option<String>,
    pinata_api_secret: Option<String>,
    pinata_base_url: Option<String>,

    // Logging
    log_level: String,
    log_format: String,

    // Development
    dev_mode: bool,
}

impl AppConfig {
    fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                Some(path)
            } else {
                None
            }
        };

        let mut builder = Config::builder();

        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }

        builder = builder.add_source(config::Environment::with_prefix("PINLEDGER"));

        let config = builder.build()?;

        let owner = get_string_value(&config, &["owner", "registry.owner"])
            .map(|value| {
                Address::from_hex(&value).with_context(|| format!("invalid OWNER address {value}"))
            })
            .transpose()?;

        let rpc_port = match get_string_value(&config, &["rpc_port", "rpc.port"]) {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("invalid RPC_PORT {value}"))?,
            None => DEFAULT_RPC_PORT,
        };

        let rpc_allowed_origins = get_string_value(
            &config,
            &["rpc_allowed_origins", "rpc.allowed_origins"],
        )
        .map(|value| split_list(&value))
        .unwrap_or_default();

        let data_dir = get_string_value(&config, &["data_dir", "storage.data_dir"])
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            config_path: resolved_path,
            node_id: get_string_value(&config, &["node_id", "node.id"])
                .unwrap_or_else(|| "pinledger-node".to_string()),
            owner,
            rpc_host: get_string_value(&config, &["rpc_host", "rpc.host"])
                .unwrap_or_else(|| DEFAULT_RPC_HOST.to_string()),
            rpc_port,
            rpc_allowed_origins,
            data_dir,
            store: get_string_value(&config, &["store", "storage.backend"])
                .map(|value| StoreMode::from_env(&value))
                .unwrap_or(StoreMode::Sled),
            pin_backend: get_string_value(&config, &["pin_backend", "pinning.backend"])
                .map(|value| PinBackend::from_env(&value))
                .unwrap_or(PinBackend::Stub),
            pinata_jwt: get_string_value(&config, &["pinata_jwt", "pinning.pinata_jwt"]),
            pinata_api_key: get_string_value(
                &config,
                &["pinata_api_key", "pinning.pinata_api_key"],
            ),
            pinata_api_secret: get_string_value(
                &config,
                &["pinata_api_secret", "pinning.pinata_api_secret"],
            ),
            pinata_base_url: get_string_value(
                &config,
                &["pinata_base_url", "pinning.pinata_base_url"],
            ),
            log_level: get_string_value(&config, &["log_level", "logging.level"])
                .unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(&config, &["log_format", "logging.format"])
                .unwrap_or_else(|| "pretty".to_string()),
            dev_mode: false,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("NODE_ID must not be empty");
        }
        if self.rpc_port == 0 {
            anyhow::bail!("RPC_PORT must be greater than zero");
        }
        if self.store == StoreMode::Sled && self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("DATA_DIR must not be empty when STORE=sled");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("LOG_FORMAT must be json or pretty, got {}", self.log_format);
        }
        Ok(())
    }

    fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }

    fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("pinledger"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) -> Result<()> {
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = PathBuf::from(data_dir);
    }

    if let Some(owner) = matches.get_one::<String>("owner") {
        config.owner = Some(
            Address::from_hex(owner).with_context(|| format!("invalid --owner address {owner}"))?,
        );
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(rpc_host) = matches.get_one::<String>("rpc-host") {
        config.rpc_host = rpc_host.clone();
    }

    if let Some(rpc_port) = matches.get_one::<u16>("rpc-port") {
        config.rpc_port = *rpc_port;
    }

    if matches.get_flag("dev") {
        config.dev_mode = true;
        config.store = StoreMode::Memory;
        config.pin_backend = PinBackend::Stub;
        config.log_level = "debug".to_string();
        config.log_format = "pretty".to_string();
        if config.rpc_allowed_origins.is_empty() {
            config.rpc_allowed_origins = vec!["*".to_string()];
        }
    }

    Ok(())
}

fn open_ledger_store(config: &AppConfig) -> Result<Arc<dyn LedgerStore>> {
    match config.store {
        StoreMode::Memory => Ok(Arc::new(MemoryLedgerStore::new())),
        StoreMode::Sled => {
            let path = config.ledger_path();
            ensure_storage_directory(&config.data_dir)?;
            let store = SledLedgerStore::open(&path)
                .with_context(|| format!("failed to open ledger at {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

fn resolve_owner(config: &AppConfig, store: &dyn LedgerStore) -> Result<Address> {
    if let Some(owner) = config.owner {
        return Ok(owner);
    }
    if let Some(snapshot) = store.load()? {
        return Ok(snapshot.owner);
    }
    if config.dev_mode {
        warn!("No OWNER configured; dev ledger is owned by the zero address");
        return Ok(Address::ZERO);
    }
    anyhow::bail!("PINLEDGER_OWNER is required to initialize a new ledger")
}

fn build_pin_service(config: &AppConfig) -> Result<Arc<dyn PinService>> {
    match config.pin_backend {
        PinBackend::Stub => Ok(Arc::new(StubPinService::new())),
        PinBackend::Pinata => {
            let mut pinata = PinataConfig::from_credentials(
                config.pinata_jwt.clone(),
                config.pinata_api_key.clone(),
                config.pinata_api_secret.clone(),
            )?;
            if let Some(base_url) = &config.pinata_base_url {
                pinata = pinata.with_base_url(base_url.clone());
            }
            Ok(Arc::new(PinataClient::new(pinata)?))
        }
    }
}

fn ensure_storage_directory(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create data directory {}", path.display()))
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

fn build_cli() -> Command {
    Command::new("pinledger-node")
        .version(PINLEDGER_VERSION)
        .about("PinLedger file registry node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory"),
        )
        .arg(
            Arg::new("owner")
                .long("owner")
                .value_name("ADDRESS")
                .help("Registry owner used when initializing a new ledger"),
        )
        .arg(
            Arg::new("dev")
                .long("dev")
                .action(ArgAction::SetTrue)
                .help("In-memory ledger, stub pinning and verbose logs"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level filter (RUST_LOG takes precedence)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("json or pretty"),
        )
        .arg(
            Arg::new("rpc-host")
                .long("rpc-host")
                .value_name("HOST")
                .help("RPC bind host"),
        )
        .arg(
            Arg::new("rpc-port")
                .long("rpc-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("RPC bind port"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    init_logging(&config)?;

    info!(
        version = PINLEDGER_VERSION,
        commit = git_commit_hash(),
        node_id = %config.node_id,
        "Starting PinLedger node"
    );
    if let Some(path) = &config.config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let store = open_ledger_store(&config)?;
    let owner = resolve_owner(&config, store.as_ref())?;
    let registry = Arc::new(FileRegistry::open(owner, store)?);
    let pin_service = build_pin_service(&config)?;
    info!(
        store = %config.store,
        pin_backend = %config.pin_backend,
        owner = %registry.owner(),
        files = registry.file_count(),
        "Registry ready"
    );

    let state = AppState::new(registry.clone(), pin_service, config.node_id.clone())
        .with_allowed_origins(config.rpc_allowed_origins.clone());

    let served = start_server(state, &config.rpc_addr()).await;

    info!("Flushing ledger");
    if let Err(err) = registry.flush() {
        warn!("Failed to flush ledger on shutdown: {err}");
    }

    served
}
