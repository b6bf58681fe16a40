use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Install the stderr subscriber once; stdout is reserved for JSON reports.
pub fn init_tracing() {
  let _ = INIT.get_or_init(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
      .with_env_filter(filter)
      .with_target(false)
      .with_writer(std::io::stderr)
      .try_init();
  });
}
