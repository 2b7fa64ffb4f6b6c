use log::info;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};

use gpoll::{AppConfig, AppState};

#[cfg(feature = "hardware-gpio")]
use gpoll::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use gpoll::MockGpioBackend;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPOLL_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(
        AppConfig::load_from_file(&config_path)
            .unwrap_or_else(|e| panic!("Failed to load config: {e}")),
    );

    let backend = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(
                LibgpiodBackend::new(&config)
                    .unwrap_or_else(|e| panic!("Failed to init libgpiod backend: {e}")),
            )
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockGpioBackend::default())
        }
    };

    let app_state = AppState::new(config.clone(), backend);

    if config.autostart {
        let mut controller = app_state.controller.lock().await;
        controller.start();
        controller
            .poll()
            .unwrap_or_else(|e| panic!("Failed to start polling: {e}"));
        info!(
            "Polling {} configured lines every {}ms",
            config.lines.len(),
            config.poll_interval_ms
        );
    }

    let http_cfg = config.http.clone();
    let scope_path = http_cfg.path.clone();
    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .service(server_state.api_scope(&scope_path))
    });

    let (server, bind_addrs) = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            remove_stale_socket(socket_path)?;
            (
                server.bind_uds(socket_path)?.bind_auto_h2c(host)?,
                format!("{socket_path} and {host}"),
            )
        }
        (Some(socket_path), None) => {
            remove_stale_socket(socket_path)?;
            (server.bind_uds(socket_path)?, socket_path.clone())
        }
        (None, Some(host)) => (server.bind_auto_h2c(host)?, host.clone()),
        (None, None) => {
            panic!("Config error: either 'unix_socket' or 'host' must be specified")
        }
    };

    info!("Starting server on {bind_addrs}...");

    server.run().await?;

    info!("Server stopped, releasing GPIO");
    app_state.controller.lock().await.stop().await;

    Ok(())
}

fn remove_stale_socket(socket_path: &str) -> std::io::Result<()> {
    if Path::new(socket_path).exists() {
        fs::remove_file(socket_path)?;
    }
    Ok(())
}
