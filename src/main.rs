use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use shared_overlay_snapshotter::{Config, OverlaySnapshotter};

#[derive(Parser, Debug)]
#[command(
    name = "shared-overlay-snapshotter",
    about = "Overlayfs snapshotter with shared writable layers and short snapshot paths"
)]
struct Args {
    /// Directory in which to store the snapshotter state.
    root: String,

    /// Unix socket on which to serve the snapshots API.
    socket: String,

    /// Defer filesystem removal to Cleanup.
    #[arg(long)]
    async_remove: bool,

    /// Expose the resolved upperdir as a snapshot label.
    #[arg(long)]
    upperdir_label: bool,

    /// Turn uid/gid mapping labels into overlay uidmap/gidmap options.
    #[arg(long)]
    remap_ids: bool,

    /// Place snapshot homes under the short sibling root.
    #[arg(long)]
    short_base_paths: bool,

    /// Default overlay mount option; may be given multiple times.
    #[arg(long = "mount-option")]
    mount_options: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let snapshotter = OverlaySnapshotter::new(
        Path::new(&args.root),
        Config {
            async_remove: args.async_remove,
            upperdir_label: args.upperdir_label,
            mount_options: args.mount_options,
            remap_ids: args.remap_ids,
            short_base_paths: args.short_base_paths,
        },
    )
    .context("failed to initialize snapshotter")?;

    // A leftover socket from a previous run would make bind fail.
    let _ = std::fs::remove_file(&args.socket);
    let incoming = {
        let uds = UnixListener::bind(&args.socket)
            .with_context(|| format!("failed to bind {}", args.socket))?;
        UnixListenerStream::new(uds)
    };

    info!(
        "serving snapshotter on {} with root {}",
        args.socket, args.root
    );
    Server::builder()
        .add_service(containerd_snapshots::server(Arc::new(snapshotter)))
        .serve_with_incoming(incoming)
        .await
        .context("snapshotter server failed")?;

    Ok(())
}
