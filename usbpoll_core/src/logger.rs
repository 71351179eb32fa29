//! stderr logging through the `log` facade.
//!
//! Lines look like `[1718000000123] [WARN] ThreadId(3): message`: unix millis, level, thread.

use std::io::Write;
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

use env_logger::Builder;
use log::LevelFilter;

static INIT: Once = Once::new();

/// Install the stderr logger at `level`. Idempotent; `RUST_LOG` overrides the level.
pub fn init(level: LevelFilter) {
    INIT.call_once(|| {
        let mut builder = Builder::new();
        builder
            .filter_level(level)
            .format(|buf, record| {
                let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
                let millis = ts.as_secs() * 1000 + u64::from(ts.subsec_millis());
                writeln!(buf, "[{}] [{}] {:?}: {}", millis, record.level(), std::thread::current().id(), record.args())
            })
            .parse_default_env();

        // Another logger may already be installed (tests, embedding application).
        let _ = builder.try_init();
    });
}

/// Logger for unit and integration tests.
pub fn init_for_tests() {
    init(LevelFilter::Debug);
}

#[cfg(test)]
mod tests {
    use log::{debug, warn};

    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_for_tests();
        init(LevelFilter::Error);
        debug!("debug line from test");
        warn!("warn line from test");
    }
}
