use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "20100";

const NAMESPACES: &[&str] = &[
    "coil",
    "discrete-input",
    "input-register",
    "holding-register",
    "measurement",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("gridctl")
        .version("0.1.0")
        .author("ICS Emulation Team")
        .about("Operator console for simulated grid devices")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Device host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Adapter port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("json")
                .short("j")
                .long("json")
                .help("Print raw JSON responses")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("read")
                .about("Read one point from the device memory map")
                .arg(
                    Arg::with_name("namespace")
                        .help("Point namespace")
                        .required(true)
                        .possible_values(NAMESPACES),
                )
                .arg(
                    Arg::with_name("index")
                        .help("Point index within the namespace")
                        .required(true)
                        .validator(validate_index),
                ),
        )
        .subcommand(
            SubCommand::with_name("write")
                .about("Write one point in the device memory map")
                .long_about(
                    "Writes a value to an externally writable point. The value must match \
                     the declared kind of the point: true/false for booleans, a bare \
                     integer for integer registers, and a decimal (e.g. 12.5) for floats.",
                )
                .arg(
                    Arg::with_name("namespace")
                        .help("Point namespace")
                        .required(true)
                        .possible_values(NAMESPACES),
                )
                .arg(
                    Arg::with_name("index")
                        .help("Point index within the namespace")
                        .required(true)
                        .validator(validate_index),
                )
                .arg(
                    Arg::with_name("value")
                        .help("Value to write (true/false, integer, or decimal)")
                        .required(true)
                        .allow_hyphen_values(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("status")
                .about("Fetch a one-shot plaintext snapshot of the device")
                .long_about(
                    "Connects to the device's status adapter and prints the rendered \
                     memory snapshot it returns. Point gridctl at the status adapter \
                     port, not the SCADA port.",
                ),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("Poll a point and print it on an interval")
                .arg(
                    Arg::with_name("namespace")
                        .help("Point namespace")
                        .required(true)
                        .possible_values(NAMESPACES),
                )
                .arg(
                    Arg::with_name("index")
                        .help("Point index within the namespace")
                        .required(true)
                        .validator(validate_index),
                )
                .arg(
                    Arg::with_name("interval")
                        .short("i")
                        .long("interval")
                        .value_name("MS")
                        .help("Poll interval in milliseconds")
                        .takes_value(true)
                        .default_value("1000")
                        .validator(validate_index),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let raw_json = matches.is_present("json");

    match matches.subcommand() {
        ("read", Some(sub)) => handle_read(sub, host, port, raw_json).await?,
        ("write", Some(sub)) => handle_write(sub, host, port, raw_json).await?,
        ("status", _) => handle_status(host, port).await?,
        ("watch", Some(sub)) => handle_watch(sub, host, port).await?,
        _ => {
            println!(
                "{}",
                "No command specified. Use --help for usage information.".yellow()
            );
            println!("{}", "Quick start:".bright_green());
            println!(
                "  {} Read a measurement",
                "gridctl read measurement 0".bright_cyan()
            );
            println!(
                "  {} Trip a breaker",
                "gridctl write coil 0 false".bright_cyan()
            );
            println!(
                "  {} Dump the memory map",
                "gridctl -p <status-port> status".bright_cyan()
            );
        }
    }

    Ok(())
}

fn validate_index(v: String) -> Result<(), String> {
    v.parse::<u64>()
        .map(|_| ())
        .map_err(|_| "must be a non-negative integer".to_string())
}

/// CLI namespace names to the wire names the SCADA adapter deserializes.
fn wire_namespace(cli: &str) -> &'static str {
    match cli {
        "coil" => "Coil",
        "discrete-input" => "DiscreteInput",
        "input-register" => "InputRegister",
        "holding-register" => "HoldingRegister",
        _ => "Measurement",
    }
}

/// Parses an operator-typed value into the externally tagged form the SCADA
/// adapter expects. "true"/"false" become booleans, bare integers become
/// integer registers, anything else must parse as a float.
fn parse_value(raw: &str) -> Result<serde_json::Value, String> {
    match raw {
        "true" => return Ok(serde_json::json!({ "Bool": true })),
        "false" => return Ok(serde_json::json!({ "Bool": false })),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(serde_json::json!({ "Int": n }));
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(serde_json::json!({ "Float": f })),
        _ => Err(format!("cannot interpret {:?} as a point value", raw)),
    }
}

fn render_value(value: &serde_json::Value) -> String {
    if let Some(b) = value.get("Bool").and_then(|v| v.as_bool()) {
        return b.to_string();
    }
    if let Some(n) = value.get("Int").and_then(|v| v.as_i64()) {
        return n.to_string();
    }
    if let Some(f) = value.get("Float").and_then(|v| v.as_f64()) {
        return f.to_string();
    }
    value.to_string()
}

async fn handle_read(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    raw_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let namespace = matches.value_of("namespace").unwrap();
    let index: u64 = matches.value_of("index").unwrap().parse()?;

    let request = serde_json::json!({
        "op": "read",
        "namespace": wire_namespace(namespace),
        "index": index,
    });
    let response = send_request(host, port, &request).await?;

    if raw_json {
        println!("{}", response);
        return Ok(());
    }

    let parsed: serde_json::Value = serde_json::from_str(&response)?;
    if parsed["ok"].as_bool().unwrap_or(false) {
        println!(
            "{} {}[{}] = {}",
            "OK".green(),
            namespace,
            index,
            render_value(&parsed["value"]).bright_cyan()
        );
    } else {
        print_rejected("read", &parsed);
    }
    Ok(())
}

async fn handle_write(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    raw_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let namespace = matches.value_of("namespace").unwrap();
    let index: u64 = matches.value_of("index").unwrap().parse()?;
    let value = parse_value(matches.value_of("value").unwrap())?;

    let request = serde_json::json!({
        "op": "write",
        "namespace": wire_namespace(namespace),
        "index": index,
        "value": value,
    });
    let response = send_request(host, port, &request).await?;

    if raw_json {
        println!("{}", response);
        return Ok(());
    }

    let parsed: serde_json::Value = serde_json::from_str(&response)?;
    if parsed["ok"].as_bool().unwrap_or(false) {
        println!(
            "{} {}[{}] set to {}",
            "OK".green(),
            namespace,
            index,
            render_value(&value).bright_cyan()
        );
    } else {
        print_rejected("write", &parsed);
    }
    Ok(())
}

async fn handle_status(host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        println!("{}", line);
    }
    Ok(())
}

async fn handle_watch(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let namespace = matches.value_of("namespace").unwrap();
    let index: u64 = matches.value_of("index").unwrap().parse()?;
    let interval: u64 = matches.value_of("interval").unwrap_or("1000").parse()?;

    let request = serde_json::json!({
        "op": "read",
        "namespace": wire_namespace(namespace),
        "index": index,
    });
    let request_line = format!("{}\n", request);

    println!(
        "{}",
        format!(
            "Watching {}[{}] every {}ms (Ctrl+C to stop)",
            namespace, index, interval
        )
        .dimmed()
    );

    // One connection for the whole watch; the adapter answers each line.
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval.max(10)));

    loop {
        ticker.tick().await;
        writer.write_all(request_line.as_bytes()).await?;
        let line = match lines.next_line().await? {
            Some(line) => line,
            None => {
                println!("{}", "connection closed by device".yellow());
                break;
            }
        };
        let parsed: serde_json::Value = serde_json::from_str(&line)?;
        if parsed["ok"].as_bool().unwrap_or(false) {
            println!(
                "[{}] {}[{}] = {}",
                unix_seconds(),
                namespace,
                index,
                render_value(&parsed["value"]).bright_cyan()
            );
        } else {
            print_rejected("read", &parsed);
            break;
        }
    }
    Ok(())
}

fn print_rejected(action: &str, parsed: &serde_json::Value) {
    let reason = parsed["error"].as_str().unwrap_or("request rejected");
    println!("{} {} failed: {}", "ERR".red(), action, reason.bright_red());
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!(
                "{} failed to connect to device at {}",
                "ERR".red(),
                addr.bright_white()
            );
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!(
                    "{} no adapter is listening there; check the device config",
                    "hint:".yellow()
                );
            }
            Err(e.into())
        }
    }
}

async fn send_request(
    host: &str,
    port: u16,
    request: &serde_json::Value,
) -> Result<String, Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();

    let line = format!("{}\n", request);
    let response = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        writer.write_all(line.as_bytes()).await?;
        let mut lines = BufReader::new(reader).lines();
        match lines.next_line().await? {
            Some(line) => Ok(line),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device closed connection",
            )),
        }
    })
    .await;

    match response {
        Ok(result) => Ok(result?),
        Err(_) => {
            eprintln!("{} request timed out after 5 seconds", "ERR".red());
            Err("request timeout".into())
        }
    }
}

fn unix_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
