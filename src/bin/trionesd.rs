use std::env;
use std::time::Duration;

use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use triones_led_controller::btle::{AdapterSelector, BtleAdapter};
use triones_led_controller::*;

const USAGE: &str = "Usage: trionesd <id/mac address> [adapter]
Append :ack to a command to wait for the strip to confirm it";

/// One line of input, already parsed
enum Request {
    PowerOn,
    PowerOff,
    Color(u8, u8, u8),
    White(u8),
    Mode(i64, i64),
    Quit,
}

/// Parses one request line. A trailing `:ack` asks the strip to confirm the
/// write, e.g. `set_color:255,0,0:ack` or `power_on:ack`.
fn parse_request(line: &str) -> std::result::Result<(Request, bool), String> {
    let line = line.trim();
    let (line, ack) = match line.strip_suffix(":ack") {
        Some(rest) => (rest, true),
        None => (line, false),
    };
    parse_command(line).map(|request| (request, ack))
}

fn parse_command(line: &str) -> std::result::Result<Request, String> {
    let mut cmd = line.splitn(2, ':');
    let name = cmd.next().unwrap_or_default();
    let args: Vec<i64> = match cmd.next() {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().parse().map_err(|_| format!("invalid number: {s}")))
            .collect::<std::result::Result<_, _>>()?,
        None => Vec::new(),
    };

    match (name, args.as_slice()) {
        ("power_on", []) => Ok(Request::PowerOn),
        ("power_off", []) => Ok(Request::PowerOff),
        ("set_color", [r, g, b]) => {
            let color = codec::ColorCommand::from_unclamped(*r, *g, *b);
            Ok(Request::Color(color.red, color.green, color.blue))
        }
        ("set_color", _) => {
            Err("Invalid color format. Use R,G,B (e.g., 255,0,0 for red)".to_string())
        }
        ("set_white", [i]) => Ok(Request::White(
            codec::WhiteCommand::from_unclamped(*i).intensity,
        )),
        ("set_white", _) => Err("Invalid white format. Use I (0-255)".to_string()),
        ("set_mode", [m, s]) => Ok(Request::Mode(*m, *s)),
        ("set_mode", _) => Err("Invalid mode format. Use M,S (e.g., 37,10)".to_string()),
        ("quit", []) => Ok(Request::Quit),
        ("", _) => Err("No command given".to_string()),
        (other, _) => Err(format!("Unknown command: {other}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr, replies to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("triones_led_controller=warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // Get a target id/mac address from command line arguments.
    // If not provided, exit.
    let args: Vec<_> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }
    if args[1] == "-h" || args[1] == "--help" {
        eprintln!("{USAGE}");
        std::process::exit(0);
    }
    let selector = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(AdapterSelector::Default);

    let adapter = AdapterHandle::new(BtleAdapter::new(selector, ScanConfig::default()));
    let config = SessionConfig::default()
        .with_connection(ConnectionConfig::default().with_command_delay(Duration::ZERO));
    let session = Session::open(args[1].as_str().into(), adapter, true, config).await?;

    // Inform about successful initialization
    println!("OK");

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
        };
        let Ok(Some(line)) = line else {
            break;
        };

        let (request, ack) = match parse_request(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                println!("ERR {e}");
                continue;
            }
        };
        let outcome = match request {
            Request::PowerOn => session.set_power(true, ack).await,
            Request::PowerOff => session.set_power(false, ack).await,
            Request::Color(r, g, b) => session.set_color(r, g, b, ack).await,
            Request::White(i) => session.set_white(i, ack).await,
            Request::Mode(m, s) => session.set_builtin_mode(m, s, ack).await,
            Request::Quit => break,
        };
        match outcome {
            Ok(()) => println!("OK"),
            Err(e) => println!("ERR {e}"),
        }
    }

    if let Err(e) = session.close().await {
        warn!("Closing session: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_requests() {
        assert!(matches!(parse_request("power_on"), Ok((Request::PowerOn, false))));
        assert!(matches!(
            parse_request("set_color: 300, -4, 12"),
            Ok((Request::Color(255, 0, 12), false))
        ));
        assert!(matches!(
            parse_request("set_white:90"),
            Ok((Request::White(90), false))
        ));
        assert!(matches!(
            parse_request("set_mode:37,5"),
            Ok((Request::Mode(37, 5), false))
        ));
        assert!(parse_request("set_color:1,2").is_err());
        assert!(parse_request("set_color:a,b,c").is_err());
        assert!(parse_request("dance").is_err());
        assert!(parse_request("").is_err());
    }

    #[test]
    fn ack_suffix_requests_confirmation() {
        assert!(matches!(
            parse_request("power_off:ack"),
            Ok((Request::PowerOff, true))
        ));
        assert!(matches!(
            parse_request("set_color:255,0,0:ack\n"),
            Ok((Request::Color(255, 0, 0), true))
        ));
        assert!(matches!(
            parse_request("set_mode:40,10:ack"),
            Ok((Request::Mode(40, 10), true))
        ));
        assert!(matches!(parse_request("quit:ack"), Ok((Request::Quit, true))));
        assert!(parse_request("set_white:ack").is_err());
    }
}
