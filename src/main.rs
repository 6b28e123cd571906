use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use color_eyre::eyre::Result;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, trace};
use tracing_subscriber::EnvFilter;
use triones_led_controller::btle::{AdapterSelector, BtleAdapter};
use triones_led_controller::codec::{ColorCommand, WhiteCommand};
use triones_led_controller::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Hardware address (or platform id) of the LED controller
    /// (not needed for `modes`)
    #[arg(short, long)]
    address: Option<String>,
    /// Bluetooth adapter: index, name (e.g. hci0) or "default"
    #[arg(long, default_value = "default")]
    adapter: AdapterSelector,
    /// Do not reset the adapter before connecting
    #[arg(long)]
    no_reset: bool,
    /// Wait for the controller to acknowledge every write
    #[arg(long)]
    ack: bool,
    /// How long to wait for an acknowledgment, in milliseconds
    #[arg(long, default_value_t = 3000)]
    ack_timeout_ms: u64,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Demonstration of LED features
    Demo {
        /// Duration of each demo step in seconds
        #[arg(short, long, default_value_t = 5)]
        duration: u64,
    },
    /// Turn LED strip on
    On,
    /// Turn LED strip off
    Off,
    /// Set to red color
    Red,
    /// Set to green color
    Green,
    /// Set to blue color
    Blue,
    /// Set custom RGB color
    Color {
        /// Red value (0-255)
        #[arg(short, long, default_value_t = 255, allow_negative_numbers = true)]
        red: i64,
        /// Green value (0-255)
        #[arg(short, long, default_value_t = 255, allow_negative_numbers = true)]
        green: i64,
        /// Blue value (0-255)
        #[arg(short, long, default_value_t = 255, allow_negative_numbers = true)]
        blue: i64,
    },
    /// Switch to the white channel
    White {
        /// Intensity (0-255)
        #[arg(short, long, default_value_t = 255, allow_negative_numbers = true)]
        intensity: i64,
    },
    /// Start a built-in animation
    Mode {
        /// Mode name (e.g. seven-color-cross-fade) or code (37-56)
        #[arg(short, long, default_value = "seven-color-cross-fade")]
        mode: String,
        /// Animation speed (1-255)
        #[arg(short, long, default_value_t = 10)]
        speed: i64,
    },
    /// List built-in animation modes
    Modes,
}


#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    // Initialize tracing with pretty colors
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("triones_led_controller=info")),
        )
        .compact()
        .init();

    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let command = cli.command.unwrap_or(Commands::Demo { duration: 5 });
    if let Commands::Modes = command {
        for mode in BuiltInMode::ALL {
            println!("{:>3}  {}", mode.code(), mode);
        }
        return Ok(());
    }
    let Some(address) = cli.address else {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "--address is required to talk to a controller",
            )
            .exit();
    };

    let config = SessionConfig::default().with_connection(
        ConnectionConfig::default().with_ack_timeout(Duration::from_millis(cli.ack_timeout_ms)),
    );
    let adapter = AdapterHandle::new(BtleAdapter::new(cli.adapter, ScanConfig::default()));
    let session = match Session::open(address.into(), adapter, !cli.no_reset, config).await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to connect to device: {}", e);
            return Err(e.into());
        }
    };

    let ack = cli.ack;
    let outcome = run(&session, command, ack).await;
    if let Err(e) = session.close().await {
        debug!("Session close reported: {}", e);
    }
    outcome
}

async fn run(session: &Session<BtleAdapter>, command: Commands, ack: bool) -> Result<()> {
    match command {
        Commands::Demo { duration } => run_demo(session, duration, ack).await?,
        Commands::On => session.set_power(true, ack).await?,
        Commands::Off => session.set_power(false, ack).await?,
        Commands::Red => {
            // First ensure device is on, then set color
            session.set_power(true, ack).await?;
            session.set_color(255, 0, 0, ack).await?;
        }
        Commands::Green => {
            session.set_power(true, ack).await?;
            session.set_color(0, 255, 0, ack).await?;
        }
        Commands::Blue => {
            session.set_power(true, ack).await?;
            session.set_color(0, 0, 255, ack).await?;
        }
        Commands::Color { red, green, blue } => {
            let color = ColorCommand::from_unclamped(red, green, blue);
            session.set_power(true, ack).await?;
            session
                .set_color(color.red, color.green, color.blue, ack)
                .await?;
        }
        Commands::White { intensity } => {
            session.set_power(true, ack).await?;
            session
                .set_white(WhiteCommand::from_unclamped(intensity).intensity, ack)
                .await?;
        }
        Commands::Mode { mode, speed } => {
            let code = match mode.trim().parse::<i64>() {
                Ok(code) => code,
                Err(_) => mode.parse::<BuiltInMode>()?.into(),
            };
            debug!("Using mode code: {}", code);
            session.set_power(true, ack).await?;
            session.set_builtin_mode(code, speed, ack).await?;
        }
        Commands::Modes => {}
    }
    Ok(())
}

/// Sleep for specified number of seconds
#[instrument]
async fn sleep(seconds: u64) {
    trace!("Sleeping for {}s", seconds);
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    trace!("Sleep completed");
}

/// Run a demonstration of various LED strip features
#[instrument(skip(session))]
async fn run_demo(session: &Session<BtleAdapter>, duration: u64, ack: bool) -> Result<()> {
    info!("Running LED strip demo with {}s intervals", duration);

    info!("Turning LEDs off");
    session.set_power(false, ack).await?;
    sleep(duration).await;

    info!("Turning LEDs on");
    session.set_power(true, ack).await?;
    sleep(duration).await;

    for (name, (r, g, b)) in [
        ("red", (255, 0, 0)),
        ("green", (0, 255, 0)),
        ("blue", (0, 0, 255)),
    ] {
        info!("Setting color to {}", name);
        session.set_color(r, g, b, ack).await?;
        sleep(duration).await;
    }

    info!("Setting white to half intensity");
    session.set_white(128, ack).await?;
    sleep(duration).await;

    info!("Setting white to full intensity");
    session.set_white(255, ack).await?;
    sleep(duration).await;

    for (mode, speed) in [
        (BuiltInMode::SevenColorCrossFade, 20),
        (BuiltInMode::SevenColorJumping, 5),
        (BuiltInMode::SevenColorStrobe, 40),
    ] {
        info!("Setting {} mode at speed {}", mode, speed);
        session.set_builtin_mode(mode.into(), speed, ack).await?;
        sleep(duration).await;
    }

    info!("Back to static white");
    session.set_color(255, 255, 255, ack).await?;
    sleep(1).await;

    info!("Turning LEDs off to end demo");
    session.set_power(false, ack).await?;

    info!("Demo completed!");
    Ok(())
}
