use env_logger::Target;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Initialise `env_logger`.
///
/// Logs go to `log_file` when given (created/appended); if the file cannot be
/// opened we fall back to stderr. `RUST_LOG` overrides the level chosen from
/// `verbosity` (0 = info, 1 = debug, 2+ = trace).
pub fn init_with(log_file: Option<PathBuf>, verbosity: u8) {
    let target = log_file
        .and_then(|path| {
            (|| -> io::Result<Target> {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)?;
                Ok(Target::Pipe(Box::new(file)))
            })()
            .ok()
        })
        .unwrap_or(Target::Stderr);

    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(target)
        .try_init();
}
