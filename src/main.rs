use disasm_rs::{Config, InputSource, LogSink, analyze};
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::new()?;

    if std::env::args().len() == 1 {
        eprintln!("usage: disasm-rs <file>...");
        std::process::exit(1);
    }

    for arg in std::env::args().skip(1) {
        let bytes = match std::fs::read(&arg) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("{}: ERROR: Can't open file: {}", arg, e);
                continue;
            }
        };
        let name = std::path::Path::new(&arg)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| arg.clone());

        let mut sink = LogSink;
        let report = match analyze(InputSource::new(name, bytes), None, &config, &mut sink) {
            Ok(report) => report,
            Err(e) => {
                eprintln!("{}: ERROR: {}", arg, e);
                continue;
            }
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
