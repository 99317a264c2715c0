//! SpanDB CLI - offline inspection of a local block backend

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use spandb_core::backend::{BackendReader, LocalBackend};
use spandb_core::block::BackendBlock;
use spandb_core::blocklist::{Blocklist, BlocklistSnapshot, Poller};
use spandb_core::metrics::Metrics;
use spandb_core::model::object_decoder;
use spandb_core::BlockMeta;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "spandb-cli", version, about = "Inspect a SpanDB local backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List active and compacted blocks
    ListBlocks {
        /// Root directory of the backend
        #[arg(long)]
        path: PathBuf,
        /// Only this tenant
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Find a trace in every block of a tenant and print it as JSON
    Find {
        /// Root directory of the backend
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        tenant: String,
        /// Trace ID in hex
        id: String,
    },
}

struct Inspector {
    reader: Arc<dyn BackendReader>,
    blocklist: Blocklist,
    metrics: Arc<Metrics>,
}

impl Inspector {
    async fn open(path: &Path) -> anyhow::Result<Self> {
        if !path.is_dir() {
            bail!("backend directory {} does not exist", path.display());
        }
        let backend = Arc::new(LocalBackend::new(path)?);
        let metrics = Arc::new(Metrics::unregistered());

        let poller = Poller::new(backend.clone(), backend.clone(), 16, metrics.clone());
        let results = poller
            .do_poll(&BlocklistSnapshot::default())
            .await
            .context("failed to poll backend")?;
        let blocklist = Blocklist::new();
        blocklist.apply_poll_results(results);

        Ok(Self {
            reader: backend,
            blocklist,
            metrics,
        })
    }

    fn list_blocks(&self, tenant: Option<&str>) {
        let tenants = match tenant {
            Some(t) => vec![t.to_string()],
            None => self.blocklist.tenants(),
        };

        for tenant in tenants {
            println!("tenant {}", tenant);
            println!(
                "  {:<36}  {:>5}  {:>8}  {:>10}  {:<20}  {:<20}  {}",
                "block", "level", "objects", "size", "start", "end", "ids"
            );
            for meta in self.blocklist.metas(&tenant).iter() {
                println!("  {}", format_meta(meta));
            }

            let compacted = self.blocklist.compacted_metas(&tenant);
            if !compacted.is_empty() {
                println!("  compacted:");
                for c in compacted.iter() {
                    println!(
                        "  {}  at {}",
                        format_meta(&c.meta),
                        c.compacted_time.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
    }

    async fn find(&self, tenant: &str, id: &[u8]) -> anyhow::Result<Option<serde_json::Value>> {
        let snapshot = self.blocklist.snapshot();
        let mut metas: Vec<BlockMeta> = snapshot.metas(tenant).iter().cloned().collect();
        metas.extend(snapshot.compacted_metas(tenant).iter().map(|c| c.meta.clone()));

        let cancel = CancellationToken::new();
        let mut objects = Vec::new();
        let mut data_encoding = None;
        for meta in metas.into_iter().filter(|m| m.contains_id(id)) {
            let block_id = meta.block_id;
            let encoding = meta.data_encoding.clone();
            let block = BackendBlock::new(meta, self.reader.clone(), self.metrics.clone());
            match block.find_by_id(id, &cancel).await {
                Ok(Some(object)) => {
                    objects.push(object);
                    data_encoding = Some(encoding);
                }
                Ok(None) => {}
                Err(e) => eprintln!("warning: block {} failed: {}", block_id, e),
            }
        }

        let Some(data_encoding) = data_encoding else {
            return Ok(None);
        };
        let decoder = object_decoder(&data_encoding)?;
        let parts: Vec<&[u8]> = objects.iter().map(Vec::as_slice).collect();
        let trace = decoder.prepare_for_read(&decoder.combine(&parts)?)?;
        Ok(Some(serde_json::to_value(trace)?))
    }
}

fn format_meta(meta: &BlockMeta) -> String {
    format!(
        "{:<36}  {:>5}  {:>8}  {:>10}  {:<20}  {:<20}  {}..{}",
        meta.block_id,
        meta.compaction_level,
        meta.total_objects,
        meta.size,
        meta.start_time.format("%Y-%m-%d %H:%M:%S"),
        meta.end_time.format("%Y-%m-%d %H:%M:%S"),
        hex::encode(&meta.min_id),
        hex::encode(&meta.max_id),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::ListBlocks { path, tenant } => {
            let inspector = Inspector::open(&path).await?;
            inspector.list_blocks(tenant.as_deref());
        }
        Command::Find { path, tenant, id } => {
            let id = hex::decode(&id).with_context(|| format!("trace id {} is not hex", id))?;
            let inspector = Inspector::open(&path).await?;
            match inspector.find(&tenant, &id).await? {
                Some(trace) => println!("{}", serde_json::to_string_pretty(&trace)?),
                None => bail!("trace {} not found for tenant {}", hex::encode(&id), tenant),
            }
        }
    }

    Ok(())
}
