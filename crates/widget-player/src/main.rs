//! Widget player: plays a library directory through the widget engine and exposes an
//! HTTP control API.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use widget_engine::backend::device;
use widget_player::cli::Args;
use widget_player::config::PlayerConfig;
use widget_player::http_api::{self, ApiState};
use widget_player::player::PlayerCommand;
use widget_player::runtime;
use widget_player::state::SharedState;

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,widget_player=info,widget_engine=info")
        }))
        .init();

    if args.list_devices {
        for info in device::list_devices(&cpal::default_host())? {
            let marker = if info.default { "*" } else { " " };
            println!("{marker} {} ({}-{} Hz)", info.name, info.min_rate, info.max_rate);
        }
        return Ok(());
    }

    let config = PlayerConfig::from_args(&args)?;
    tracing::info!(
        library = %config.library_root.display(),
        start = %config.start_dir.display(),
        remote = ?config.remote_base,
        bind = %config.http_bind,
        "starting widget-player"
    );

    let state = SharedState::new();
    let http_bind = config.http_bind;
    let (player, engine_thread) = runtime::spawn_runtime(config, state.clone())?;

    // The HTTP server stops itself on Ctrl-C; the runtime persists settings and stops
    // playback on its way out.
    let shutdown = player.clone();
    ctrlc::set_handler(move || {
        let _ = shutdown.send(PlayerCommand::Shutdown);
    })
    .context("install ctrl-c handler")?;

    let served = http_api::serve(http_bind, ApiState { player: player.clone(), state }).await;
    let _ = player.send(PlayerCommand::Shutdown);
    if engine_thread.join().is_err() {
        tracing::error!("engine runtime panicked");
    }
    served.context("http api")
}
