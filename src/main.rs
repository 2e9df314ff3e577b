use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use portico::{
    setup_tracing, AppResult, MessageDispatcher, OutboundMessage, ServerConfig, ServerRuntime,
};
use serde_json::json;
use tokio::{runtime, signal};
use tracing::info;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _log_guard = setup_tracing();

    //setup config
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let server_config = Arc::new(ServerConfig::set_up_config(config_path)?);

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", server_config);
        return Ok(());
    }

    rt.block_on(run_server(server_config))
}

async fn run_server(config: Arc<ServerConfig>) -> AppResult<()> {
    let runtime = ServerRuntime::new(config);

    // the demo verb set; a real deployment registers its own handlers here
    let dispatcher = MessageDispatcher::builder()
        .register("echo", |conn, msg| {
            conn.send(OutboundMessage::Json(msg.clone()));
        })
        .register("ping", |conn, _msg| {
            conn.send(OutboundMessage::Json(json!({"op": "pong"})));
        })
        .on_connection_died(|conn, reason| {
            info!("{} session ended: {}", conn.label(), reason);
        })
        .build();
    let app_factory = runtime.dispatch_factory(dispatcher);

    let bound = runtime.start_from_config(app_factory).await?;
    info!("server up with {} listener(s)", bound.len());

    signal::ctrl_c().await?;
    info!("got shutdown signal");
    runtime.shutdown();
    Ok(())
}
