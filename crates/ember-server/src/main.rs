use std::sync::Arc;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;

use ember_protocol::KeyDirectory;

/// Command-line arguments for the key server.
struct Args {
    bind: String,
    server_name: String,
    /// `localpart:password` accounts created at startup.
    users: Vec<(String, String)>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut parsed = Args {
        bind: "127.0.0.1:8008".into(),
        server_name: "localhost".into(),
        users: Vec::new(),
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--bind" => parsed.bind = args.next().context("--bind needs an address")?,
            "--server-name" => parsed.server_name = args.next().context("--server-name needs a name")?,
            "--user" => {
                let entry = args.next().context("--user needs localpart:password")?;
                let (localpart, password) = entry
                    .split_once(':')
                    .context("--user expects localpart:password")?;
                parsed.users.push((localpart.to_owned(), password.to_owned()));
            }
            other => bail!("unknown argument {other}"),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    tracing::info!(server_name = %args.server_name, "ember-server starting");

    let directory = Arc::new(KeyDirectory::new(args.server_name));
    for (localpart, password) in &args.users {
        directory.register(localpart, password);
    }

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    ember_server::serve(listener, directory, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        tracing::info!("shutting down");
    })
    .await
    .context("server error")?;

    tracing::info!("ember-server stopped");
    Ok(())
}
