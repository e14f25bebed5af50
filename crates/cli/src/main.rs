//! PinLedger Command Line Interface
//!
//! Talks to a node's HTTP API, or straight to Pinata for the `pinata` commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pinledger_pinning::{
    gateway_url, PinService, PinataClient, PinataConfig, DEFAULT_IPFS_GATEWAY,
};
use pinledger_registry::{compute_cid_hash, Address, CidHash};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use url::Url;

const CALLER_HEADER: &str = "x-caller-address";

#[derive(Parser)]
#[command(name = "pinledger-cli")]
#[command(about = "PinLedger file registry command line interface", long_about = None)]
#[command(version)]
struct Cli {
    /// RPC endpoint URL
    #[arg(long, alias = "rpc", env = "PINLEDGER_RPC_URL", default_value = "http://localhost:8080")]
    rpc_url: String,

    /// Account that signs mutating requests
    #[arg(long, env = "PINLEDGER_CALLER")]
    caller: Option<String>,

    /// Print debug logs
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the registry hash of a CID locally
    Hash { cid: String },
    /// Upload a local file to Pinata and register the returned CID
    Upload {
        path: PathBuf,
        /// Name recorded in the registry (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
        /// Gateway used for the printed retrieval link
        #[arg(long, env = "PINLEDGER_IPFS_GATEWAY", default_value = DEFAULT_IPFS_GATEWAY)]
        gateway: String,
    },
    /// Register a CID
    Store {
        cid: String,
        name: String,
        /// File size in bytes
        size: u64,
    },
    /// Fetch metadata by CID
    Meta { cid: String },
    /// Fetch metadata by CID hash
    MetaByHash { hash: String },
    /// Check whether a CID is registered
    Exists { cid: String },
    /// Pin a CID through the node and flag it in the registry
    Pin { cid: String },
    /// Unpin a CID through the node and clear the registry flag
    Unpin { cid: String },
    /// List CID hashes stored by an uploader
    Files { address: String },
    /// Registry statistics
    Stats,
    /// Talk to Pinata directly (PINATA_JWT or PINATA_API_KEY + PINATA_API_SECRET)
    Pinata {
        #[command(subcommand)]
        action: PinataCommands,
    },
}

#[derive(Subcommand)]
enum PinataCommands {
    /// Pin a CID
    Pin { cid: String },
    /// Unpin a CID
    Unpin { cid: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .compact()
        .init();

    let rpc = RpcClient::new(&cli.rpc_url, cli.caller.as_deref())?;

    handle_command(cli.command, &rpc).await
}

struct RpcClient {
    base: Url,
    caller: Option<Address>,
    client: reqwest::Client,
}

impl RpcClient {
    fn new(rpc_url: &str, caller: Option<&str>) -> Result<Self> {
        let base = Url::parse(rpc_url).with_context(|| format!("invalid --rpc-url {rpc_url}"))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("--rpc-url {rpc_url} cannot carry a path");
        }
        let caller = caller
            .map(|value| {
                Address::from_hex(value).with_context(|| format!("invalid --caller {value}"))
            })
            .transpose()?;
        Ok(Self {
            base,
            caller,
            client: reqwest::Client::new(),
        })
    }

    /// Build a URL under the RPC base; each segment is percent-encoded on its own.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("RPC URL cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn require_caller(&self) -> Result<Address> {
        self.caller
            .context("--caller (or PINLEDGER_CALLER) is required for this command")
    }

    fn with_caller(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.caller {
            Some(caller) => request.header(CALLER_HEADER, caller.to_hex()),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = self.with_caller(request).send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        debug!(%status, "RPC response");
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if status.is_success() {
            Ok(body)
        } else {
            anyhow::bail!(
                "request failed (status {}): {}",
                status,
                serde_json::to_string_pretty(&body)?
            )
        }
    }
}

fn pin_endpoint(rpc: &RpcClient, cid: &str) -> Result<Url> {
    rpc.endpoint(&["hashes", &compute_cid_hash(cid).to_hex(), "pin"])
}

async fn handle_command(cmd: Commands, rpc: &RpcClient) -> Result<()> {
    let client = &rpc.client;

    let json = match cmd {
        Commands::Hash { cid } => {
            println!("{}", compute_cid_hash(&cid));
            return Ok(());
        }
        Commands::Pinata { action } => return handle_pinata_commands(action).await,
        Commands::Upload {
            path,
            name,
            gateway,
        } => {
            rpc.require_caller()?;
            let pinata = PinataClient::new(PinataConfig::from_env()?)?;
            upload_and_register(&pinata, rpc, &path, name, &gateway).await?
        }
        Commands::Store { cid, name, size } => {
            rpc.require_caller()?;
            let payload = json!({ "cid": cid, "name": name, "size": size });
            rpc.send(client.post(rpc.endpoint(&["files"])?).json(&payload))
                .await?
        }
        Commands::Meta { cid } => {
            rpc.send(client.get(rpc.endpoint(&["files", &cid])?))
                .await?
        }
        Commands::MetaByHash { hash } => {
            let cid_hash = CidHash::from_hex(&hash).context("invalid CID hash")?;
            rpc.send(client.get(rpc.endpoint(&["hashes", &cid_hash.to_hex()])?))
                .await?
        }
        Commands::Exists { cid } => {
            rpc.send(client.get(rpc.endpoint(&["files", &cid, "exists"])?))
                .await?
        }
        Commands::Pin { cid } => {
            rpc.require_caller()?;
            let url = pin_endpoint(rpc, &cid)?;
            rpc.send(client.post(url).json(&json!({ "cid": cid })))
                .await?
        }
        Commands::Unpin { cid } => {
            rpc.require_caller()?;
            let url = pin_endpoint(rpc, &cid)?;
            rpc.send(client.delete(url).json(&json!({ "cid": cid })))
                .await?
        }
        Commands::Files { address } => {
            let address = Address::from_hex(&address).context("invalid uploader address")?;
            rpc.send(client.get(rpc.endpoint(&["uploaders", &address.to_hex(), "files"])?))
                .await?
        }
        Commands::Stats => rpc.send(client.get(rpc.endpoint(&["registry"])?)).await?,
    };

    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

/// Upload `path` through `pin_service`, then record the returned CID with the node.
async fn upload_and_register(
    pin_service: &dyn PinService,
    rpc: &RpcClient,
    path: &Path,
    name: Option<String>,
    gateway: &str,
) -> Result<Value> {
    rpc.require_caller()?;
    let name = match name {
        Some(name) => name,
        None => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name; pass --name", path.display()))?,
    };
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let size = content.len() as u64;

    let receipt = pin_service.upload(&name, content).await?;
    let cid = receipt.pinned_hash.clone();
    info!(cid = %cid, backend = pin_service.name(), "File uploaded");

    let payload = json!({ "cid": cid, "name": name, "size": size });
    let record = rpc
        .send(rpc.client.post(rpc.endpoint(&["files"])?).json(&payload))
        .await
        .with_context(|| format!("uploaded as {cid} but registering it failed"))?;

    Ok(json!({
        "cid": cid,
        "gateway_url": gateway_url(gateway, &cid),
        "upload": receipt,
        "record": record,
    }))
}

async fn handle_pinata_commands(cmd: PinataCommands) -> Result<()> {
    let client = PinataClient::new(PinataConfig::from_env()?)?;

    match cmd {
        PinataCommands::Pin { cid } => {
            let receipt = client.pin(&cid).await?;
            println!(
                "Pinned {} ({} bytes) at {}",
                receipt.pinned_hash, receipt.size, receipt.timestamp
            );
        }
        PinataCommands::Unpin { cid } => {
            client.unpin(&cid).await?;
            println!("Unpinned {cid}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinledger_pinning::StubPinService;
    use pinledger_registry::FileRegistry;
    use pinledger_rpc::{build_router, AppState};
    use std::sync::Arc;

    const CALLER: &str = "0x0101010101010101010101010101010101010101";

    async fn spawn_node() -> (String, Arc<FileRegistry>, StubPinService) {
        let registry = Arc::new(FileRegistry::new(Address([0xaa; 20])));
        let stub = StubPinService::new();
        let app = build_router(AppState::new(
            registry.clone(),
            Arc::new(stub.clone()),
            "cli-test",
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), registry, stub)
    }

    #[test]
    fn parses_store_with_caller() {
        let cli = Cli::try_parse_from([
            "pinledger-cli",
            "--caller",
            CALLER,
            "store",
            "QmFile",
            "report.pdf",
            "2048",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Store { ref cid, size: 2048, .. } if cid == "QmFile"
        ));
    }

    #[test]
    fn parses_upload_with_default_gateway() {
        let cli =
            Cli::try_parse_from(["pinledger-cli", "upload", "./report.pdf", "--name", "Q3"])
                .unwrap();
        match cli.command {
            Commands::Upload {
                path,
                name,
                gateway,
            } => {
                assert_eq!(path, PathBuf::from("./report.pdf"));
                assert_eq!(name.as_deref(), Some("Q3"));
                assert_eq!(gateway, DEFAULT_IPFS_GATEWAY);
            }
            _ => panic!("expected upload command"),
        }
    }

    #[test]
    fn parses_nested_pinata_commands() {
        let cli = Cli::try_parse_from(["pinledger-cli", "pinata", "unpin", "QmFile"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Pinata { action: PinataCommands::Unpin { ref cid } } if cid == "QmFile"
        ));
    }

    #[test]
    fn rpc_client_normalizes_base_and_caller() {
        let rpc = RpcClient::new("http://localhost:8080/", None).unwrap();
        assert_eq!(
            rpc.endpoint(&["registry"]).unwrap().as_str(),
            "http://localhost:8080/registry"
        );
        assert!(rpc.require_caller().is_err());

        assert!(RpcClient::new("http://localhost:8080", Some("not-hex")).is_err());
        assert!(RpcClient::new("not a url", None).is_err());
    }

    #[test]
    fn cid_segments_are_percent_encoded() {
        let rpc = RpcClient::new("http://localhost:8080/api", None).unwrap();
        let url = rpc.endpoint(&["files", "Qm?odd#cid/x", "exists"]).unwrap();
        assert_eq!(url.path(), "/api/files/Qm%3Fodd%23cid%2Fx/exists");
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }

    #[test]
    fn pin_endpoint_uses_local_hash() {
        let rpc = RpcClient::new("http://localhost:8080", None).unwrap();
        let hash = compute_cid_hash("QmFile");
        assert_eq!(
            pin_endpoint(&rpc, "QmFile").unwrap().path(),
            format!("/hashes/{}/pin", hash.to_hex())
        );
    }

    #[tokio::test]
    async fn odd_cid_round_trips_through_the_node() {
        let (base, registry, _) = spawn_node().await;
        let rpc = RpcClient::new(&base, Some(CALLER)).unwrap();
        let cid = "Qm/odd?cid#1";

        rpc.send(
            rpc.client
                .post(rpc.endpoint(&["files"]).unwrap())
                .json(&json!({ "cid": cid, "name": "odd", "size": 1 })),
        )
        .await
        .unwrap();

        let meta = rpc
            .send(rpc.client.get(rpc.endpoint(&["files", cid]).unwrap()))
            .await
            .unwrap();
        assert_eq!(meta["cid_hash"], compute_cid_hash(cid).to_hex());

        let exists = rpc
            .send(rpc.client.get(rpc.endpoint(&["files", cid, "exists"]).unwrap()))
            .await
            .unwrap();
        assert_eq!(exists["exists"], true);
        assert!(registry.file_exists_by_cid(cid));
    }

    #[tokio::test]
    async fn upload_registers_returned_cid() {
        let (base, registry, stub) = spawn_node().await;
        let rpc = RpcClient::new(&base, Some(CALLER)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"%PDF-1.7 quarterly report").unwrap();

        let out = upload_and_register(&stub, &rpc, &path, None, "https://gateway.example/ipfs/")
            .await
            .unwrap();

        let cid = StubPinService::content_cid(b"%PDF-1.7 quarterly report");
        assert_eq!(out["cid"], cid);
        assert_eq!(
            out["gateway_url"],
            format!("https://gateway.example/ipfs/{cid}")
        );
        assert_eq!(out["record"]["name"], "report.pdf");
        assert_eq!(out["record"]["size"], 25);
        assert_eq!(out["record"]["uploader"], CALLER);

        let record = registry.get_file_meta_by_hash(&compute_cid_hash(&cid)).unwrap();
        assert_eq!(record.size, 25);
        assert!(stub.is_pinned(&cid));
    }

    #[tokio::test]
    async fn upload_without_caller_touches_nothing() {
        let (base, registry, stub) = spawn_node().await;
        let rpc = RpcClient::new(&base, None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"notes").unwrap();

        assert!(upload_and_register(&stub, &rpc, &path, None, DEFAULT_IPFS_GATEWAY)
            .await
            .is_err());
        assert_eq!(stub.calls(), 0);
        assert_eq!(registry.file_count(), 0);
    }

    #[tokio::test]
    async fn rejected_request_surfaces_error_body() {
        let (base, _, _) = spawn_node().await;
        let rpc = RpcClient::new(&base, Some(CALLER)).unwrap();

        let err = rpc
            .send(
                rpc.client
                    .post(rpc.endpoint(&["files"]).unwrap())
                    .json(&json!({ "cid": "QmBad", "name": "bad", "size": -5 })),
            )
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("400"), "unexpected error: {message}");
        assert!(message.contains("invalid_body"), "unexpected error: {message}");
    }
}
