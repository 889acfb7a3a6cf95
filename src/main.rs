mod config;
mod context;
mod fanout;
mod fs;
mod replica;
mod status;
mod sync;
mod util;

use clap::Parser;
use config::{MAX_BACKING_ROOTS, Registry};
use fanout::Fanout;
use fs::MirrorFs;
use fuse3::MountOptions;
use fuse3::path::Session;
#[cfg(unix)]
use futures_util::future::poll_fn;
use std::ffi::OsString;
use std::path::PathBuf;
#[cfg(unix)]
use std::pin::Pin;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
#[cfg(unix)]
use tokio::sync::oneshot;

#[derive(Parser, Debug)]
#[command(name = "mirrorfs")]
#[command(about = "FUSE3 filesystem that mirrors every operation across backing directories")]
struct Cli {
    /// Backing directory to replicate into. Repeat for each replica (up to 3).
    #[arg(long = "root", required = true)]
    roots: Vec<PathBuf>,

    /// Which backing root holds the authoritative copy. Must also be given
    /// via --root. Defaults to the first root.
    #[arg(long)]
    master_root: Option<PathBuf>,

    /// Mount point for the mirrored filesystem.
    mountpoint: PathBuf,

    /// Path prefix to rewrite before resolving backing paths (pair with
    /// --prefix-to).
    #[arg(long, requires = "prefix_to")]
    prefix_from: Option<OsString>,

    /// Replacement for the --prefix-from prefix.
    #[arg(long, requires = "prefix_from")]
    prefix_to: Option<OsString>,

    /// Allow other users to access the mount (passes allow_other to FUSE).
    #[arg(long, default_value_t = false)]
    allow_other: bool,

    /// Permit mounting on a non-empty directory.
    #[arg(long, default_value_t = false)]
    nonempty: bool,

    /// Maximum write size advertised to the kernel, in KiB.
    #[arg(long, default_value_t = 128)]
    max_write_kb: u32,

    /// Log replication and repair activity (shorthand for RUST_LOG=debug).
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn build_registry(cli: &Cli) -> anyhow::Result<Registry> {
    if cli.roots.len() > MAX_BACKING_ROOTS {
        anyhow::bail!(
            "at most {MAX_BACKING_ROOTS} backing roots are supported, got {}",
            cli.roots.len()
        );
    }
    if let Some(master) = &cli.master_root
        && !cli.roots.contains(master)
    {
        anyhow::bail!("--master-root {} is not one of the --root values", master.display());
    }

    let mut registry = Registry::new();
    for root in &cli.roots {
        let master = cli.master_root.as_deref() == Some(root.as_path());
        registry
            .add_root(root.clone(), master)
            .map_err(|status| anyhow::anyhow!("cannot open backing root {}: {status:?}", root.display()))?;
    }
    if let (Some(from), Some(to)) = (&cli.prefix_from, &cli.prefix_to) {
        registry.set_prefix_map(from.clone(), to.clone());
    }
    Ok(registry)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if cli.debug {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let registry = build_registry(&cli)?;
    log::info!(
        "mirroring across {} backing roots, master {}",
        registry.len(),
        cli.master_root
            .as_deref()
            .unwrap_or(&cli.roots[0])
            .display()
    );
    let fs = MirrorFs::new(Fanout::new(registry), cli.max_write_kb);

    let mut mount_opts = MountOptions::default();
    mount_opts.fs_name("mirrorfs");
    mount_opts.allow_other(cli.allow_other);
    mount_opts.nonempty(cli.nonempty);

    let session = Session::new(mount_opts);
    let handle = session.mount(fs, cli.mountpoint).await?;

    #[cfg(unix)]
    {
        // Listen for termination signals and unmount cleanly before exiting.
        let (unmount_tx, unmount_rx) = oneshot::channel::<()>();

        let mut mount_task = tokio::spawn(async move {
            let mut handle = Some(handle);
            let mut handle_future = poll_fn(|cx| {
                let handle = handle.as_mut().expect("mount handle missing");
                Pin::new(handle).poll(cx)
            });

            let res = tokio::select! {
                res = &mut handle_future => res,
                _ = unmount_rx => {
                    let handle = handle.take().expect("mount handle missing");
                    handle.unmount().await
                }
            };

            res.map_err(anyhow::Error::from)
        });

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let signals = async {
            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
        };
        tokio::pin!(signals);

        let result = tokio::select! {
            res = &mut mount_task => res,
            _ = &mut signals => {
                let _ = unmount_tx.send(());
                mount_task.await
            }
        };

        result??;
    }

    #[cfg(not(unix))]
    {
        // Block until the filesystem is unmounted. This keeps the
        // process alive instead of exiting immediately after mount.
        handle.await?;
    }

    Ok(())
}
