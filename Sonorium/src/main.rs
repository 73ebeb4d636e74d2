use std::sync::Arc;
use std::time::Duration;

use sonaudio::{MediaDecoderFactory, ThemeTuning};
use soncontrol::{ControlSurfaceExt, EngineSettings, SessionController};
use sonserver::{LoggingOptions, Server, init_logging};
use sonstream::{ChannelConfig, ChannelPool};
use sontheme::{ThemeLibrary, ThemeSupplier};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LoggingOptions::default());
    let config = sonconfig::get_config();

    // ========== PHASE 1 : Moteur audio ==========

    let sample_rate = config.get_sample_rate();
    let factory = Arc::new(MediaDecoderFactory::new(sample_rate)?);

    let themes_dir = config.get_themes_dir()?;
    info!("🎵 Scanning theme library in {}", themes_dir);
    let themes = Arc::new(ThemeLibrary::with_default_tuning(
        themes_dir.as_str(),
        tuning_from_config(&config),
    )?);
    let available = themes.list_themes();
    info!("✅ {} theme(s) available", available.len());
    for theme in &available {
        info!("  - {} ({} tracks)", theme.name, theme.track_count);
    }

    let channel_config = ChannelConfig {
        sample_rate,
        bitrate_bps: config.get_bitrate(),
        crossfade_window_s: config.get_crossfade_window_s(),
        listener_buffer_s: config.get_listener_buffer_s(),
        listener_dead_after_drop_s: config.get_listener_dead_after_drop_s(),
        listener_pcm_queue: config.get_listener_pcm_queue(),
        ..Default::default()
    };
    let pool = ChannelPool::new(config.get_max_channels(), channel_config);
    pool.spawn_reaper(Duration::from_secs_f64(config.get_idle_channel_timeout_s()));

    // ========== PHASE 2 : Contrôleur de sessions ==========

    let mut server = Server::new_configured();
    let base_url = format!(
        "{}:{}",
        server.base_url().trim_end_matches('/'),
        server.http_port()
    );
    let controller = Arc::new(SessionController::new(
        Arc::clone(&pool),
        themes,
        factory,
        EngineSettings {
            sample_rate,
            base_url,
        },
    ));

    // Les intégrations transport (DLNA, Chromecast, ...) s'abonnent ici ;
    // sans intégration, on trace les intents.
    let transport_rx = controller.events().subscribe();
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = transport_rx.recv() {
            info!(
                session = %event.session_id,
                action = ?event.action,
                stream_url = %event.stream_url,
                speakers = ?event.speaker_targets,
                "Transport intent"
            );
        }
    });

    // ========== PHASE 3 : Surface HTTP ==========

    server
        .add_route("/info", || async {
            serde_json::json!({
                "name": "Sonorium",
                "version": env!("CARGO_PKG_VERSION"),
            })
        })
        .await;

    server
        .init_control_surface(Arc::clone(&controller))
        .await
        .expect("Failed to initialize control surface");

    server.run().await?;
    Ok(())
}

fn tuning_from_config(config: &sonconfig::Config) -> ThemeTuning {
    ThemeTuning {
        long_file_threshold_s: config.get_long_file_threshold_s(),
        short_file_threshold_s: config.get_short_file_threshold_s(),
        sparse_min_interval_s: config.get_sparse_min_interval_s(),
        sparse_max_interval_s: config.get_sparse_max_interval_s(),
        sparse_variance: config.get_sparse_variance(),
        sparse_startup_delay_s: config.get_sparse_startup_delay_s(),
        min_gap_after_exclusive_s: config.get_min_gap_after_exclusive_s(),
        initial_exclusive_delay_s: config.get_initial_exclusive_delay_s(),
        presence_period_s: config.get_presence_period_s(),
        presence_fade_s: config.get_presence_fade_s(),
        loop_crossfade_s: config.get_loop_crossfade_s(),
    }
}
