//! Strata S3 gateway
//!
//! Serves the S3 wire subset over the bucket/object metadata sub-store
//! and the local chunk store.

mod s3;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use s3::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use strata_common::Config;
use strata_kv::{KvStore, KvStoreConfig};
use strata_s3::S3MetaStore;
use strata_store::{ChunkStore, LocalStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "strata-gateway", about = "S3-compatible gateway for Strata")]
struct Args {
    /// Listen address for the S3 API
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Directory for metadata state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for object bodies
    #[arg(long)]
    chunk_dir: Option<PathBuf>,

    /// Region reported in responses
    #[arg(long)]
    region: Option<String>,

    /// Owner reported by ListBuckets
    #[arg(long)]
    owner: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::default();
    if let Some(listen) = args.listen {
        config.gateway.listen = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.engine.data_dir = data_dir;
    }
    if let Some(chunk_dir) = args.chunk_dir {
        config.engine.chunk_dir = chunk_dir;
    }
    if let Some(region) = args.region {
        config.gateway.region = region;
    }
    if let Some(owner) = args.owner {
        config.gateway.owner = owner;
    }

    let kv = Arc::new(KvStore::open(KvStoreConfig::with_data_dir(
        config.engine.data_dir.join("s3"),
    ))?);
    let chunks: Arc<dyn ChunkStore> = Arc::new(LocalStore::open(&config.engine.chunk_dir)?);
    chunks.health_check()?;

    let state = Arc::new(AppState {
        meta: S3MetaStore::new(kv),
        chunks,
        region: config.gateway.region.clone(),
        owner: config.gateway.owner.clone(),
    });

    let app = Router::new()
        .route("/", get(s3::list_buckets))
        .route(
            "/:bucket",
            get(s3::list_objects)
                .put(s3::create_bucket)
                .delete(s3::delete_bucket)
                .head(s3::head_bucket),
        )
        .route(
            "/:bucket/*key",
            get(s3::get_object)
                .put(s3::put_object)
                .delete(s3::delete_object)
                .head(s3::head_object),
        )
        .with_state(state);

    info!(listen = %config.gateway.listen, "starting S3 gateway");
    let listener = tokio::net::TcpListener::bind(config.gateway.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
