use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, operations, ConnectionState, ListenerEvent, Params, ProtocolClient,
};
use shared::domain::{CookieJar, Credentials};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatlink")]
struct Cli {
    /// Overrides `login_base_url` from client.toml.
    #[arg(long)]
    login_base_url: Option<String>,
    #[arg(long)]
    device_id: Option<String>,
    /// Raw `Cookie` header value from an authenticated browser session.
    #[arg(long)]
    cookie: Option<String>,
    #[arg(long)]
    user_agent: Option<String>,
    #[arg(long)]
    language: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the operations this build knows about.
    Operations,
    /// Bootstrap a session and print its identity and services.
    Login,
    /// Bootstrap, then dispatch one operation with JSON arguments.
    Call {
        operation: String,
        #[arg(default_value = "{}")]
        args: String,
    },
    /// Bootstrap, then print realtime events until Ctrl-C.
    Listen,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    if let Command::Operations = cli.command {
        for spec in operations::ALL {
            println!(
                "{:<18} {:?} {}:{} requires {:?}",
                spec.name, spec.method, spec.service, spec.path, spec.required_args
            );
        }
        return Ok(());
    }

    let mut settings = load_settings();
    if let Some(url) = cli.login_base_url.clone() {
        settings.login_base_url = url;
    }
    let credentials = credentials(&cli, settings.credentials())?;
    let client = ProtocolClient::new(settings).context("failed to build client")?;
    let session = client
        .bootstrap(credentials)
        .await
        .context("handshake failed")?;

    match cli.command {
        Command::Operations => {}
        Command::Login => {
            println!("identity={}", session.identity());
            for service in session.service_endpoints().services() {
                let endpoints = session.service_endpoints().get(service).unwrap_or_default();
                println!("service {service}: {} endpoint(s)", endpoints.len());
            }
        }
        Command::Call { operation, args } => {
            let spec = operations::find(&operation)
                .ok_or_else(|| anyhow!("unknown operation `{operation}`"))?;
            let args: serde_json::Value =
                serde_json::from_str(&args).context("operation args must be json")?;
            let data = client
                .dispatch(&session, spec, Params::from_json(args)?)
                .await
                .with_context(|| format!("operation `{operation}` failed"))?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Listen => {
            let listener = client.listener(session)?;
            let mut events = listener.subscribe();
            let handle = listener.spawn();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("ctrl-c received, shutting down listener");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(ListenerEvent::Remote(remote)) => println!("{remote:?}"),
                        Some(ListenerEvent::State(ConnectionState::Closed)) | None => break,
                        Some(ListenerEvent::State(state)) => info!(state = ?state, "listener state"),
                        Some(ListenerEvent::SequenceGap { expected, received }) => {
                            warn!(expected, received, "events missed");
                        }
                        Some(ListenerEvent::SequenceReset { previous, received }) => {
                            warn!(previous, received, "event numbering restarted");
                        }
                        Some(ListenerEvent::ReplaySuppressed { seq }) => info!(seq, "skipped replayed event"),
                        Some(ListenerEvent::Overflow { dropped }) => warn!(dropped, "output fell behind"),
                        Some(ListenerEvent::Error(err)) => warn!(error = %err, "listener error"),
                    },
                }
            }
            handle.shutdown().await;
        }
    }

    Ok(())
}

/// Command-line identity wins over the settings file.
fn credentials(cli: &Cli, configured: Option<Credentials>) -> Result<Credentials> {
    let mut credentials = match (&cli.device_id, configured) {
        (Some(device_id), configured) => {
            let base = Credentials::new(device_id.clone());
            match configured {
                Some(configured) => base
                    .with_cookie_jar(configured.cookie_jar)
                    .with_user_agent(configured.user_agent)
                    .with_language_tag(configured.language_tag),
                None => base,
            }
        }
        (None, Some(configured)) => configured,
        (None, None) => Credentials::new(uuid::Uuid::new_v4().to_string()),
    };

    if let Some(cookie) = &cli.cookie {
        credentials = credentials.with_cookie_jar(CookieJar::parse(cookie));
    }
    if let Some(user_agent) = &cli.user_agent {
        credentials = credentials.with_user_agent(user_agent.clone());
    }
    if let Some(language) = &cli.language {
        credentials = credentials.with_language_tag(language.clone());
    }
    if credentials.cookie_jar.is_empty() {
        warn!("no cookies supplied; the platform will likely reject the login");
    }
    Ok(credentials)
}
