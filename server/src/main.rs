use std::io;

use actix_web::{web, App, HttpServer};

use server::config::ServerConfig;
use server::handlers::root;
use server::registry::spawn_server;

fn load_config() -> io::Result<ServerConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CANVAS_CONFIG").ok());
    match path {
        Some(path) => {
            log::info!("Loading config from {}", path);
            ServerConfig::load(&path)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
        }
        None => Ok(ServerConfig::default()),
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = load_config()?;
    let srv_tx = spawn_server(config.clone());
    let bind_addr = config.bind_addr.clone();
    log::info!("Listening on {}", bind_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(srv_tx.clone()))
            .app_data(web::Data::new(config.clone()))
            .configure(root)
    })
    .bind(bind_addr)?
    .run()
    .await
}
