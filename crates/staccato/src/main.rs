use std::process::ExitCode;

use clap::Parser;
use staccato::logging::{init_logging, init_logging_json};
use staccato::{Config, Server, ServerResult};
use tracing::{error, info};

fn main() -> ExitCode {
    let config = Config::parse();

    let logging = if config.log_json {
        init_logging_json(&config.log_level)
    } else {
        init_logging(&config.log_level)
    };
    if let Err(e) = logging {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> ServerResult<()> {
    let server = Server::bind(config)?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("received SIGINT, shutting down");
        handle.trigger();
    })
    .map_err(|e| staccato::ServerError::Config(format!("cannot install signal handler: {}", e)))?;

    server.serve()
}
