use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vows_editor::{EngineConfig, Services};
use vows_workspace::{serve, DataDirWatcher, LocalBackend, SessionHost};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let mut port: u16 = 3030;
    let mut data_dir = std::env::current_dir()?.join("data");
    let mut config = EngineConfig::default();
    let mut watch = true;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port = args[i + 1].parse()?;
                    i += 2;
                } else {
                    eprintln!("--port requires a value");
                    std::process::exit(1);
                }
            }
            "--debounce-ms" => {
                if i + 1 < args.len() {
                    config.slug_debounce = Duration::from_millis(args[i + 1].parse()?);
                    i += 2;
                } else {
                    eprintln!("--debounce-ms requires a value");
                    std::process::exit(1);
                }
            }
            "--no-watch" => {
                watch = false;
                i += 1;
            }
            "--help" | "-h" => {
                println!("Usage: vows-server [OPTIONS] [DATA_DIR]");
                println!();
                println!("Options:");
                println!("  -p, --port <PORT>       HTTP port to listen on (default: 3030)");
                println!("  --debounce-ms <MS>      Slug check debounce (default: 500)");
                println!("  --no-watch              Ignore edits made to the data directory");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Arguments:");
                println!("  [DATA_DIR]              Document directory (default: ./data)");
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                data_dir = PathBuf::from(arg);
                i += 1;
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                std::process::exit(1);
            }
        }
    }

    println!("Starting vows server...");
    println!("Data directory: {:?}", data_dir);
    println!("HTTP listening on 127.0.0.1:{}", port);

    let backend = Arc::new(LocalBackend::with_data_dir(&data_dir)?);
    let _watcher = if watch {
        Some(DataDirWatcher::spawn(backend.clone())?)
    } else {
        None
    };

    let host = Arc::new(SessionHost::new(Services::from_backend(backend), config));
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    serve(addr, host).await?;

    Ok(())
}
