//! dockwire CLI - follow engine events, logs and interactive sessions.
//!
//! This is the binary entry point. See the `dockwire` library for the
//! stream layer itself.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dockwire::{
    AttachOptions, ClientConfig, Engine, EndReason, ExecConfig, ExecStart, LogOptions, LogOutput,
    StreamEvent, StreamType,
};
use mimalloc::MiMalloc;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

/// Global allocator for the binary.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "dockwire")]
#[command(version)]
#[command(about = "Stream engine events, logs and exec/attach sessions")]
struct Cli {
    /// Engine address, overriding DOCKER_HOST and the config file
    #[arg(long, global = true)]
    host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print engine events as JSON lines until interrupted
    Events {
        /// Filter as key=value (e.g. type=container); repeatable
        #[arg(long = "filter", short = 'f')]
        filters: Vec<String>,
    },
    /// Print a container's logs
    Logs {
        /// Container id or name
        container: String,
        /// Keep following new output
        #[arg(long, short = 'f')]
        follow: bool,
        /// Number of trailing lines
        #[arg(long)]
        tail: Option<String>,
        /// Show timestamps
        #[arg(long, short = 't')]
        timestamps: bool,
    },
    /// Run a command in a running container
    Exec {
        /// Container id or name
        container: String,
        /// Allocate a TTY
        #[arg(long, short = 't')]
        tty: bool,
        /// Forward stdin
        #[arg(long, short = 'i')]
        interactive: bool,
        /// Run in the background
        #[arg(long, short = 'd')]
        detach: bool,
        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },
    /// Attach to a running container's streams
    Attach {
        /// Container id or name
        container: String,
        /// Forward stdin
        #[arg(long)]
        stdin: bool,
        /// Detach key sequence
        #[arg(long)]
        detach_keys: Option<String>,
    },
    /// Pull an image, printing progress
    Pull {
        /// Image reference (name[:tag])
        image: String,
    },
    /// Print container resource usage
    Stats {
        /// Container id or name
        container: String,
        /// Print one sample and exit
        #[arg(long)]
        no_stream: bool,
    },
    /// Wait for a container to stop
    Wait {
        /// Container id or name
        container: String,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .format_timestamp_secs()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = ClientConfig::load().context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        config.host = host;
    }

    if matches!(cli.command, Commands::Config) {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let engine = Engine::new(config).context("Invalid engine configuration")?;

    match cli.command {
        Commands::Events { filters } => events(&engine, &filters).await,
        Commands::Logs {
            container,
            follow,
            tail,
            timestamps,
        } => {
            let options = LogOptions {
                follow,
                tail,
                timestamps,
                ..LogOptions::default()
            };
            logs(&engine, &container, &options).await
        }
        Commands::Exec {
            container,
            tty,
            interactive,
            detach,
            cmd,
        } => exec(&engine, &container, cmd, tty, interactive, detach).await,
        Commands::Attach {
            container,
            stdin,
            detach_keys,
        } => {
            let options = AttachOptions {
                stdin,
                detach_keys,
                ..AttachOptions::default()
            };
            attach(&engine, &container, options).await
        }
        Commands::Pull { image } => pull(&engine, &image).await,
        Commands::Stats {
            container,
            no_stream,
        } => stats(&engine, &container, !no_stream).await,
        Commands::Wait { container, timeout } => {
            let status = engine
                .container(&container)
                .wait(timeout.map(Duration::from_secs))
                .await
                .with_context(|| format!("Failed waiting for {container}"))?;
            println!("{status}");
            Ok(())
        }
        Commands::Config => Ok(()),
    }
}

/// Turn `key=value` arguments into the engine's filter map.
fn parse_filters(filters: &[String]) -> Result<Option<Value>> {
    if filters.is_empty() {
        return Ok(None);
    }
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for filter in filters {
        let Some((key, value)) = filter.split_once('=') else {
            bail!("Filter '{filter}' is not key=value");
        };
        map.entry(key.to_string()).or_default().push(value.to_string());
    }
    Ok(Some(serde_json::to_value(map)?))
}

async fn events(engine: &Engine, filters: &[String]) -> Result<()> {
    let mut bus = engine.events();
    if let Some(filters) = parse_filters(filters)? {
        bus = bus.with_filters(filters);
    }
    let mut subscriber = bus.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                bus.stop().await;
                return Ok(());
            }
            event = subscriber.recv() => match event {
                Some(StreamEvent::Json(value)) => println!("{value}"),
                Some(StreamEvent::End(EndReason::Failed(message))) => bail!("Event stream failed: {message}"),
                Some(StreamEvent::End(reason)) => {
                    log::info!("Event stream ended: {reason:?}");
                    return Ok(());
                }
                Some(StreamEvent::Output { .. }) => {}
                None => return Ok(()),
            },
        }
    }
}

async fn logs(engine: &Engine, container: &str, options: &LogOptions) -> Result<()> {
    let output = engine
        .container(container)
        .logs(options)
        .await
        .with_context(|| format!("Failed to read logs of {container}"))?;

    match output {
        LogOutput::Lines(lines) => {
            for line in lines {
                println!("{line}");
            }
        }
        LogOutput::Stream(mut stream) => {
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            while let Some(frame) = stream.next_frame().await? {
                if frame.stream == StreamType::Stderr {
                    stderr.write_all(&frame.payload).await?;
                    stderr.flush().await?;
                } else {
                    stdout.write_all(&frame.payload).await?;
                    stdout.flush().await?;
                }
            }
            if stream.truncated() {
                log::warn!("Log stream ended mid-frame");
            }
        }
    }
    Ok(())
}

async fn exec(
    engine: &Engine,
    container: &str,
    cmd: Vec<String>,
    tty: bool,
    interactive: bool,
    detach: bool,
) -> Result<()> {
    if tty && !std::io::stdin().is_terminal() {
        log::warn!("stdin is not a terminal, TTY output may be garbled");
    }

    let config = ExecConfig {
        attach_stdin: interactive,
        tty,
        ..ExecConfig::new(cmd)
    };
    let exec = engine
        .container(container)
        .exec(&config)
        .await
        .with_context(|| format!("Failed to create exec in {container}"))?;

    match exec.start(detach, tty).await.context("Failed to start exec")? {
        ExecStart::Detached(_) => println!("{}", exec.id()),
        ExecStart::Attached(transport) => {
            let stdin: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if interactive {
                Box::new(tokio::io::stdin())
            } else {
                Box::new(tokio::io::empty())
            };
            transport
                .relay(stdin, tokio::io::stdout(), tokio::io::stderr())
                .await?;

            let inspect = exec.inspect().await?;
            if let Some(code) = inspect.get("ExitCode").and_then(Value::as_i64) {
                if code != 0 {
                    std::process::exit(i32::try_from(code).unwrap_or(1));
                }
            }
        }
    }
    Ok(())
}

async fn attach(engine: &Engine, container: &str, options: AttachOptions) -> Result<()> {
    let forward_stdin = options.stdin;
    let transport = engine.container(container).attach(options);
    transport
        .establish()
        .await
        .with_context(|| format!("Failed to attach to {container}"))?;

    let stdin: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if forward_stdin {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(tokio::io::empty())
    };
    transport
        .relay(stdin, tokio::io::stdout(), tokio::io::stderr())
        .await?;
    Ok(())
}

async fn pull(engine: &Engine, image: &str) -> Result<()> {
    let mut progress = engine
        .images()
        .pull(image)
        .await
        .with_context(|| format!("Failed to pull {image}"))?;

    while let Some(message) = progress.next().await? {
        if let Some(error) = message.get("error").and_then(Value::as_str) {
            bail!("Pull failed: {error}");
        }
        let status = message.get("status").and_then(Value::as_str).unwrap_or("");
        match message.get("id").and_then(Value::as_str) {
            Some(id) => println!("{id}: {status}"),
            None => println!("{status}"),
        }
    }
    Ok(())
}

async fn stats(engine: &Engine, container: &str, stream: bool) -> Result<()> {
    let mut samples = engine
        .container(container)
        .stats(stream)
        .await
        .with_context(|| format!("Failed to read stats of {container}"))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            sample = samples.next() => match sample? {
                Some(sample) => println!("{sample}"),
                None => return Ok(()),
            },
        }
    }
}
