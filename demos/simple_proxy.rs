//! Minimal IPTV restreamer
//!
//! Run with: cargo run --example simple_proxy [BIND_ADDR] [UPSTREAM_URL]
//!
//! Examples:
//!   cargo run --example simple_proxy                                  # 0.0.0.0:34400
//!   cargo run --example simple_proxy 127.0.0.1:8901
//!   cargo run --example simple_proxy 0.0.0.0:34400 http://src/ch.m3u8
//!
//! Registers a single playlist with two tuners and one channel under the
//! URL id `demo`, then serves it:
//!
//!   vlc http://localhost:34400/stream/demo
//!   ffplay http://localhost:34400/stream/demo
//!
//! Requires ffmpeg on PATH; every distinct upstream URL gets one ffmpeg
//! process no matter how many players connect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use restream::{AppState, Provider, Settings, StaticProviders, StreamInfo};

/// Resolve the listen address given on the command line.
///
/// Takes `IP`, `IP:PORT`, or `localhost[:PORT]`; a bare host listens on
/// the default tuner port.
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    const FALLBACK_PORT: u16 = 34400;

    let arg = match arg.strip_prefix("localhost") {
        Some(rest) => format!("127.0.0.1{rest}"),
        None => arg.to_string(),
    };

    arg.parse::<SocketAddr>()
        .or_else(|_| {
            arg.parse::<std::net::IpAddr>()
                .map(|ip| SocketAddr::from((ip, FALLBACK_PORT)))
        })
        .map_err(|_| format!("cannot listen on '{arg}': expected IP, IP:PORT or localhost[:PORT]"))
}

fn print_usage() {
    eprintln!("Usage: simple_proxy [BIND_ADDR] [UPSTREAM_URL]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR     Address to bind to (default: 0.0.0.0:34400)");
    eprintln!("  UPSTREAM_URL  Channel source (default: a local test pattern)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let bind_addr = match args.get(1) {
        Some(addr_str) => match parse_bind_addr(addr_str) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => "0.0.0.0:34400".parse()?,
    };
    let upstream = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "testsrc=size=640x360:rate=25".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("restream=debug".parse()?),
        )
        .init();

    // A synthetic source needs lavfi; a real URL streams with -c copy
    let options = if args.get(2).is_some() {
        "-hide_banner -loglevel error -i [URL] -c copy -f mpegts pipe:1"
    } else {
        "-hide_banner -loglevel error -f lavfi -i [URL] -c:v libx264 -preset veryfast -f mpegts pipe:1"
    };

    let settings = Settings::default().transcoder_options(options);

    let providers = Arc::new(StaticProviders::new());
    providers.insert(Provider {
        id: "M1".into(),
        name: "Demo playlist".into(),
        tuner: 2,
        http_proxy: None,
        origin: None,
        referer: None,
    });

    let state = AppState::new(settings, providers, None);
    state.admission.prime([StreamInfo {
        channel_number: "1".into(),
        name: "Demo channel".into(),
        playlist_id: "M1".into(),
        url: upstream,
        backup_channel_1: None,
        backup_channel_2: None,
        backup_channel_3: None,
        url_id: "demo".into(),
    }]);
    let _sweep = state.registry.spawn_sweep_task(Duration::from_secs(60));

    println!("Streaming server on http://{}", bind_addr);
    println!();
    println!("=== Watch the demo channel ===");
    println!("VLC:    vlc http://localhost:{}/stream/demo", bind_addr.port());
    println!("ffplay: ffplay http://localhost:{}/stream/demo", bind_addr.port());
    println!();

    restream::serve_until(bind_addr, state, async {
        let _ = tokio::signal::ctrl_c().await;
        println!("\nShutting down...");
    })
    .await?;

    Ok(())
}
