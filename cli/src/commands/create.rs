//! `cage create` command - Provision a container from an image.

use std::sync::Arc;

use cage_core::config::CageConfig;
use cage_runtime::{env_credentials, CreateOptions, Provisioner, RegistryResolver, ZfsDriver};
use clap::Args;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct CreateArgs {
    /// OCI image reference
    pub reference: String,

    /// Container identifier
    pub id: String,

    /// Talk to the registry over plain HTTP
    #[arg(long)]
    pub http: bool,

    /// Attach to a network, can be repeated
    #[arg(long = "net")]
    pub networks: Vec<String>,

    /// Environment variable (KEY=VALUE), can be repeated
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Command arguments replacing the image's default command
    #[arg(last = true)]
    pub args: Vec<String>,
}

pub async fn execute(
    args: CreateArgs,
    mut config: CageConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    config.plain_http |= args.http;

    let resolver = Arc::new(RegistryResolver::new(config.plain_http, env_credentials()));
    let driver = Arc::new(ZfsDriver::new());
    let provisioner = Provisioner::new(config, resolver, driver)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let options = CreateOptions {
        args: args.args,
        env: args.env,
        networks: args.networks,
    };
    let instance = provisioner
        .create(&args.reference, &args.id, &options, &cancel)
        .await?;

    println!("{}", instance.spec_path().display());
    Ok(())
}

/// Cancel `token` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> std::io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => tracing::warn!("Interrupted, cancelling"),
            _ = terminate.recv() => tracing::warn!("Terminated, cancelling"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(())
}
