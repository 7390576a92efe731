use anyhow::{Context, bail};
use callcore::net::HttpClient;
use callcore::types::CallId;
use callcore::{ControlCommand, SignalingMessage, classify};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{debug, error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use whatsapp_calling::calls::TransportError;
use whatsapp_calling::calls::transport::SignalingTransport;
use whatsapp_calling::calls::transports::{RestControl, SseTransport, WebhookTransport};
use whatsapp_calling::config::{CallConfig, TransportKind};
use whatsapp_calling_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_calling_ureq_http_client::UreqHttpClient;

// Signaling tool for the calling backends. Media needs an application that
// supplies a WebRTC engine, so this binary only watches and controls calls.
//
// Usage:
//   cargo run -- monitor                                   # webhook relay
//   cargo run -- --transport sse --phone-number-id 123 monitor
//   cargo run -- terminate --call-id wacid.HBgL...

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "whatsapp-calling", version, about = "WhatsApp Business calling signaling tool")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, global = true)]
    transport: Option<TransportKind>,

    #[arg(long, global = true)]
    backend_url: Option<String>,

    #[arg(long, global = true)]
    ws_url: Option<String>,

    #[arg(long, global = true)]
    phone_number_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and log every signaling message until Ctrl-C.
    Monitor,
    /// Ask the backend to end a call.
    Terminate {
        #[arg(long)]
        call_id: String,
    },
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = rt.block_on(run(cli));
    // Blocking reads still parked on a quiet stream are abandoned.
    rt.shutdown_timeout(SHUTDOWN_TIMEOUT);
    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = CallConfig::load(cli.config.as_deref())?;
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    if let Some(url) = cli.backend_url {
        config.backend_url = url;
    }
    if let Some(url) = cli.ws_url {
        config.ws_url = url;
    }
    if cli.phone_number_id.is_some() {
        config.phone_number_id = cli.phone_number_id;
    }
    config.validate()?;

    let transport = build_transport(&config)?;
    match cli.command {
        Command::Monitor => monitor(transport).await,
        Command::Terminate { call_id } => {
            terminate(transport, CallId::new(call_id), config.phone_number_id).await
        }
    }
}

fn build_transport(config: &CallConfig) -> anyhow::Result<Arc<dyn SignalingTransport>> {
    let http: Arc<dyn HttpClient> = Arc::new(UreqHttpClient::new());
    let control = RestControl::new(http.clone(), config.backend_url.as_str(), config.endpoints());
    info!("Using {} transport against {}", config.transport, config.backend_url);

    match config.transport {
        TransportKind::WebhookWs => Ok(Arc::new(WebhookTransport::new(
            Arc::new(TokioWebSocketTransportFactory::new()),
            config.ws_url.as_str(),
            control,
        ))),
        TransportKind::Sse => Ok(Arc::new(SseTransport::new(
            http,
            &config.backend_url,
            &config.sse_path,
            control,
        ))),
        TransportKind::Sip => Err(TransportError::Unsupported("a SIP user agent").into()),
    }
}

fn log_message(message: &SignalingMessage) {
    match message {
        SignalingMessage::ConnectionStatus { text } => info!("Status: {text}"),
        SignalingMessage::IncomingCall { call_id, from, .. } => {
            info!("Incoming call {call_id} from {from}")
        }
        other => info!(
            "{} for {}",
            other.kind(),
            other.call_id().map_or("<no call id>", CallId::as_str)
        ),
    }
    debug!("{message:?}");
}

async fn monitor(transport: Arc<dyn SignalingTransport>) -> anyhow::Result<()> {
    let mut messages = transport
        .connect()
        .await
        .context("failed to connect signaling transport")?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(message) => log_message(&message),
                None => {
                    info!("Signaling stream ended");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("Interrupted, closing");
                break;
            }
        }
    }
    transport.close().await;
    Ok(())
}

async fn terminate(
    transport: Arc<dyn SignalingTransport>,
    call_id: CallId,
    phone_number_id: Option<String>,
) -> anyhow::Result<()> {
    let response = transport
        .send(ControlCommand::Terminate {
            call_id: call_id.clone(),
            phone_number_id,
        })
        .await?;
    if let Some(text) = response.failure_text() {
        let error = classify(text, None);
        bail!("terminate {call_id} failed: {error}");
    }
    info!("Call {call_id} terminated");
    Ok(())
}
