use clap::{App, Arg};
use gridsim::{DeviceConfig, DeviceHandler};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let matches = App::new("gridsim")
        .version("0.1.0")
        .author("ICS Emulation Team")
        .about("Simulated industrial-control device launcher")
        .arg(
            Arg::with_name("configfile")
                .short("c")
                .long("configfile")
                .value_name("FILE")
                .help("Device configuration file (JSON)")
                .takes_value(true)
                .conflicts_with("configstr"),
        )
        .arg(
            Arg::with_name("configstr")
                .short("C")
                .long("configstr")
                .value_name("JSON")
                .help("Device configuration as an inline JSON string")
                .takes_value(true)
                .required_unless("configfile"),
        )
        .get_matches();

    let config = if let Some(path) = matches.value_of("configfile") {
        DeviceConfig::from_file(path)
    } else {
        // required_unless guarantees one of the two is present
        DeviceConfig::from_json(matches.value_of("configstr").unwrap_or_default())
    };

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid device configuration: {}", e);
            std::process::exit(1);
        }
    };

    let guid = config.guid;
    let handler = match DeviceHandler::start(config).await {
        Ok(handler) => handler,
        Err(e) => {
            error!(guid = %guid, error = %e, "device failed to start");
            eprintln!("fatal: {}", e);
            std::process::exit(1);
        }
    };

    info!(guid = %guid, "device started; send SIGINT to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for termination signal");
    }
    info!(guid = %guid, "termination requested");

    handler.shutdown().await;
}
