mod address;
mod config;
mod engine;
mod flow;
mod listener;

use eyre::WrapErr;
use lexopt::prelude::*;
use std::ffi::OsString;
use tokio::sync::watch;

use config::Config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--debug".to_string()) {
        std::env::set_var("RUST_LOG", "debug");
    } else if args.contains(&"-v".to_string()) || args.contains(&"--verbose".to_string()) {
        std::env::set_var("RUST_LOG", "info");
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let cli = parse_args().wrap_err("parse arguments")?;

    let cfg = Config::new(
        &cli.listen_ip,
        cli.listen_port,
        &cli.destination_ip,
        cli.destination_port,
        cli.source_bind
            .as_ref()
            .map(|(ip, port)| (ip.as_str(), *port)),
    )
    .wrap_err("invalid configuration")?;

    tracing::info!(
        listen = %cfg.listen,
        destination = %cfg.destination,
        bind_template = %cfg.bind_template,
        "starting udp relay",
    );

    let sock = listener::open(cfg.listen)
        .await
        .wrap_err("cannot start listener")?;
    let relay = engine::RelayEngine::new(sock, cfg.destination, cfg.bind_template);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_shutdown_signal(shutdown_tx));

    relay.run(shutdown_rx).await?;
    tracing::info!("clean shutdown");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM and flips the shared shutdown flag, waking
/// every `.await` selecting on it. No signal-handler code runs off the
/// main task's stack; `tokio::signal` delivers the notification as an
/// ordinary future.
async fn wait_for_shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received ctrl-c");
    }
    let _ = shutdown_tx.send(true);
}

struct Cli {
    listen_ip: String,
    listen_port: u16,
    destination_ip: String,
    destination_port: u16,
    source_bind: Option<(String, u16)>,
}

fn parse_args() -> eyre::Result<Cli> {
    let mut listen = None;
    let mut destination = None;
    let mut source_bind = None;

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next().wrap_err("parse arguments")? {
        match arg {
            Long("listen") | Short('l') if listen.is_none() => {
                listen = Some(
                    parser
                        .value()
                        .wrap_err("value missing")
                        .and_then(parse_ip_port)
                        .wrap_err("--listen")?,
                );
            }
            Long("destination") | Short('d') if destination.is_none() => {
                destination = Some(
                    parser
                        .value()
                        .wrap_err("value missing")
                        .and_then(parse_ip_port)
                        .wrap_err("--destination")?,
                );
            }
            Long("source-bind") | Short('b') if source_bind.is_none() => {
                source_bind = Some(
                    parser
                        .value()
                        .wrap_err("value missing")
                        .and_then(parse_ip_port)
                        .wrap_err("--source-bind")?,
                );
            }
            Short('v') | Long("verbose") => {}
            Long("debug") => {}
            Short('h') | Long("help") => usage(0),
            _ => return Err(arg.unexpected()).wrap_err("unexpected argument"),
        }
    }

    let Some((listen_ip, listen_port)) = listen else {
        usage(1);
    };
    let Some((destination_ip, destination_port)) = destination else {
        eyre::bail!("no destination given (--destination IP:PORT)");
    };

    Ok(Cli {
        listen_ip,
        listen_port,
        destination_ip,
        destination_port,
        source_bind,
    })
}

/// Parses `IP:PORT` into its two parts. Port 0 means "ephemeral" where
/// accepted (only meaningful for `--source-bind`).
fn parse_ip_port(arg: OsString) -> eyre::Result<(String, u16)> {
    let text = arg.to_string_lossy();
    let (ip, port) = text
        .rsplit_once(':')
        .ok_or_else(|| eyre::eyre!("expected IP:PORT, got {text:?}"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| eyre::eyre!("invalid port in {text:?}"))?;
    Ok((ip.to_string(), port))
}

fn usage(exit_with: i32) -> ! {
    let bin = std::env::args()
        .next()
        .unwrap_or_else(|| String::from(env!("CARGO_BIN_NAME")));

    eprintln!(
        "{}",
        concat!(env!("CARGO_BIN_NAME"), " ", env!("CARGO_PKG_VERSION"))
    );
    eprintln!();
    eprintln!("DESCRIPTION:");
    eprintln!("    Relays UDP datagrams between arbitrary clients and one fixed upstream");
    eprintln!("    destination, tracking one dedicated upstream socket per client flow.");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    {bin} --listen IP:PORT --destination IP:PORT [--source-bind IP:PORT]");
    eprintln!();
    eprintln!("REQUIRED ARGUMENTS:");
    eprintln!(
        "    -l, --listen IP:PORT         Inside-facing address to accept client datagrams on"
    );
    eprintln!("    -d, --destination IP:PORT    Fixed upstream destination for every flow");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!(
        "    -b, --source-bind IP:PORT    Local bind template for per-flow upstream sockets."
    );
    eprintln!("                                 Port 0 means ephemeral (default when omitted: the");
    eprintln!("                                 wildcard address in the destination's family).");
    eprintln!(
        "                                 A nonzero port pins all flows to that single port,"
    );
    eprintln!("                                 so only one flow may be live at a time.");
    eprintln!("    -v, --verbose                Enable info-level logging");
    eprintln!("    --debug                      Enable debug-level logging");
    eprintln!("    -h, --help                   Show this help message");
    eprintln!();
    eprintln!("    IP literals containing ':' are treated as IPv6; all others as IPv4.");
    std::process::exit(exit_with);
}
