use anyhow::{Context, Result};
use tokio::net::TcpListener;

use warhost::config::{Config, GameConfig};
use warhost::game::Game;
use warhost::map::Map;
use warhost::net::Announcer;

/// Exit codes: 1 = config/map error before the listener came up,
/// 2 = socket bind failure.
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/host.cfg".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: host_server [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return Ok(());
                }
            }
            _ => {}
        }
        i += 1;
    }

    let (config, map) = match load(&conf_file) {
        Ok(loaded) => loaded,
        Err(err) => {
            tracing::error!("[host] [config_error] err={:#}", err);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let bind = ("0.0.0.0", config.host_port);
    let listener = match TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("[host] [bind_error] port={} err={}", config.host_port, err);
            std::process::exit(EXIT_BIND);
        }
    };
    tracing::info!("[host] [ready] port={}", config.host_port);

    let announcer = match Announcer::bind(warhost::net::LAN_PORT).await {
        Ok(announcer) => announcer,
        Err(err) => {
            tracing::error!("[host] [udp_bind_error] err={}", err);
            std::process::exit(EXIT_BIND);
        }
    };

    // host counter 1: a single hosted game per process
    let game = Game::new(map, config, 1);
    game.run(listener, announcer).await?;
    Ok(())
}

fn load(conf_file: &str) -> Result<(GameConfig, Map)> {
    let cfg = Config::load(conf_file).with_context(|| format!("cannot load {}", conf_file))?;
    let config = GameConfig::from_config(&cfg).context("invalid host configuration")?;
    let map = Map::from_config(&cfg).context("invalid map configuration")?;
    Ok((config, map))
}
