use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use arena_clock_core::{
    AppConfig, MatchController, RemoteClockClient, RemoteCommand, RobotDirectory,
    StaticRobotDirectory, TeamColor,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

fn main() -> arena_clock_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_console(config.as_deref()),
        Commands::Send {
            command,
            millis,
            address,
        } => send_once(&command, millis, address),
        Commands::Config { config } => print_config(config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> arena_clock_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            AppConfig::load(path)
        }
        None => Ok(AppConfig::default()),
    }
}

fn run_console(config_path: Option<&Path>) -> arena_clock_core::Result<()> {
    let config = load_config(config_path)?;
    let robots = StaticRobotDirectory::new(config.robots.clone());
    let controller = MatchController::from_config(&config)?;
    controller.set_on_match_end(|| tracing::info!("time! robots disabled"))?;

    println!("Type `help` for commands.");
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("Command: ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };

        let outcome = match command.to_ascii_lowercase().as_str() {
            "start" => controller.start(),
            "pause" => controller.pause(),
            "resume" => controller.resume(),
            "ko" | "stop" => controller.knockout(),
            "add" => match words.next().and_then(parse_seconds) {
                Some(remaining) => controller.add_time(remaining),
                None => {
                    println!("Usage: add <seconds>");
                    continue;
                }
            },
            "winner" => match words.next().map(str::parse::<TeamColor>) {
                Some(Ok(team)) => controller.declare_winner(team),
                Some(Err(err)) => Err(err),
                None => {
                    println!("Usage: winner <blue|orange|yellow|green>");
                    continue;
                }
            },
            "status" => controller.snapshot().map(|snapshot| {
                println!(
                    "{} | {:.1}s left | killswitch {}",
                    snapshot.state,
                    snapshot.remaining.as_secs_f32(),
                    snapshot.killswitch.value()
                );
            }),
            "robots" => {
                for robot in robots.robots() {
                    println!("{:>4} -> {}:{}", robot.id, robot.ip, robot.port);
                }
                Ok(())
            }
            "robot" => {
                match words.next().and_then(|id| id.parse::<u32>().ok()) {
                    Some(id) => match robots.robot_info(id) {
                        Some(robot) => println!("{robot:#?}"),
                        None => println!("Robot {id} not found."),
                    },
                    None => println!("Usage: robot <id>"),
                }
                Ok(())
            }
            "help" => {
                print_help();
                Ok(())
            }
            "exit" | "quit" => break,
            _ => {
                println!("Unknown command.");
                Ok(())
            }
        };

        if let Err(err) = outcome {
            println!("{err}");
        }
    }

    controller.stop()
}

/// Parses an operator-supplied number of seconds. Negative, non-finite and
/// out-of-range values give `None`.
fn parse_seconds(word: &str) -> Option<Duration> {
    let secs = word.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

fn send_once(
    command: &str,
    millis: u64,
    address: Option<String>,
) -> arena_clock_core::Result<()> {
    let command: RemoteCommand = command.parse()?;
    let mut display = AppConfig::default().display;
    if let Some(address) = address {
        display.address = address;
    }
    let display_address = &display.address;
    tracing::info!(%command, millis, address = %display_address, "sending display command");

    let client = RemoteClockClient::from_config(&display)?;
    client.send(command, Duration::from_millis(millis));
    Ok(())
}

fn print_config(config_path: Option<&Path>) -> arena_clock_core::Result<()> {
    let config = load_config(config_path)?;
    println!("{}", config.to_json_pretty()?);
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("\tMatch: | start | pause | resume | add <seconds> | ko | winner <team> | status |");
    println!("\tRobots: | robots | robot <id> |");
    println!("\t| help | exit |");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Arena match clock, lights and countdown display", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the match controller and read operator commands from stdin.
    Run {
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Send a single command to the remote countdown display.
    Send {
        /// reset, start, pause, resume, add_time, end or a numeric code.
        command: String,
        /// Time value in milliseconds.
        millis: u64,
        /// Display address, overriding the default.
        #[arg(short, long)]
        address: Option<String>,
    },
    /// Print the effective configuration as JSON.
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_accept_plain_numbers() {
        assert_eq!(parse_seconds("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_seconds("1.5"), Some(Duration::from_millis(1_500)));
        assert_eq!(parse_seconds("0"), Some(Duration::ZERO));
    }

    #[test]
    fn seconds_reject_values_a_duration_cannot_hold() {
        for word in ["inf", "NaN", "-1", "1e20", "soon"] {
            assert_eq!(parse_seconds(word), None, "{word}");
        }
    }
}
