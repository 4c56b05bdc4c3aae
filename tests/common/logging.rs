use std::sync::Once;

use log4rs;

static LOGGER_INIT: Once = Once::new();

#[allow(unused)] // used in tests
pub fn init_default_logging() {
    LOGGER_INIT.call_once(|| {
        log4rs::init_file("log4rs.yaml", Default::default()).unwrap();
    });
}
