use std::{
  fs::File,
  io,
  path::{Path, PathBuf},
  sync::Mutex,
};

use tracing_subscriber::{prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "glyphbot=info,poise=warn,serenity=warn";

pub fn log_file_name(now: chrono::DateTime<chrono::Local>) -> String{
  format!("bot_{}.log", now.format("%Y%m%d_%H%M%S"))
}

/// Console output plus a per-run log file in `log_dir`. `RUST_LOG` overrides the filter.
pub fn init(log_dir: &Path) -> io::Result<PathBuf>{
  std::fs::create_dir_all(log_dir)?;
  let path = log_dir.join(log_file_name(chrono::Local::now()));
  let file = File::create(&path)?;

  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer())
    .with(
      tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
    )
    .init();
  Ok(path)
}
