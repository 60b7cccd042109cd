mod echo;

use bastion::config::ServerConfig;
use bastion::dispatcher::Dispatcher;
use bastion::net::service::ServiceManager;
use clap::Parser;
use echo::EchoService;
use flint::logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bastiond", about = "Connection gateway hosting the echo service")]
struct Args {
    /// Server configuration file (TOML); defaults apply when omitted.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long, default_value_t = 7171)]
    port: u16,
}

fn main() {
    let args = Args::parse();
    let log = logging::init();

    let config = match &args.config {
        Some(path) => ServerConfig::load(path),
        None => ServerConfig::default(),
    };

    let dispatcher = Dispatcher::new(&log);
    let manager = ServiceManager::open(config, dispatcher, &log)
        .expect("Error building the service manager");

    if !manager.add_service(EchoService::new(&log), args.port) {
        logging::crit!(log, "could not register the echo service"; "port" => args.port);
        return;
    }

    logging::info!(log, "echo service registered"; "port" => args.port);
    manager.run();

    manager.registry().close_all();
}
