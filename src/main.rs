//! Development static server.
//!
//! Serves one or more asset roots with stylesheet optimization enabled when
//! a cache directory is given.
//!
//! ```text
//! optiserve --root ./public [--root ./assets] [--addr 127.0.0.1:8080] [--cache-dir ./.cache]
//! ```

use std::env;
use std::path::PathBuf;
use std::process;

use optiserve::{StaticAssets, StaticOptions};
use tracing_subscriber::EnvFilter;

struct Args {
    roots: Vec<PathBuf>,
    addr: String,
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("[optiserve] {err}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = parse_args()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = StaticOptions {
        cache_dir: args.cache_dir,
        ..Default::default()
    };

    let assets = StaticAssets::new(args.roots, options)?;
    assets.serve(&args.addr).await?;
    Ok(())
}

fn parse_args() -> anyhow::Result<Args> {
    let mut roots = Vec::new();
    let mut addr = "127.0.0.1:8080".to_string();
    let mut cache_dir = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--root" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("missing value for --root"))?;
                roots.push(PathBuf::from(value));
            }
            "--addr" => {
                addr = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("missing value for --addr"))?;
            }
            "--cache-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("missing value for --cache-dir"))?;
                cache_dir = Some(PathBuf::from(value));
            }
            _ => anyhow::bail!(
                "unknown argument '{arg}'. usage: optiserve --root <path> [--root <path>...] [--addr <host:port>] [--cache-dir <path>]"
            ),
        }
    }

    if roots.is_empty() {
        anyhow::bail!("required flag missing: --root <path>");
    }

    Ok(Args {
        roots,
        addr,
        cache_dir,
    })
}
