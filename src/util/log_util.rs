use std::sync::Once;

use log4rs;

static LOGGER_INIT: Once = Once::new();

/// Initializes the `log4rs` logger using `logging_config.yaml`, falling back
/// to a plain stdout logger when the file is missing or invalid. Safe to call
/// more than once.
pub fn init() {
    LOGGER_INIT.call_once(|| {
        match log4rs::init_file("logging_config.yaml", Default::default()) {
            Ok(_) => {
                log::info!(
                    "attributionlib logging initialized from logging_config.yaml."
                );
            }
            Err(e) => {
                eprintln!(
                    "ERROR: Failed to initialize logger from logging_config.yaml: {}",
                    e
                );
                eprintln!("Falling back to basic stdout logging (Info level).");
                init_fallback();
            }
        }
    });
}

fn init_fallback() {
    let stdout_appender = log4rs::append::console::ConsoleAppender::builder()
        .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
            "{h({d(%Y-%m-%d %H:%M:%S)(utc)} - {l} - {t}: {m}{n})}",
        )))
        .build();

    let config = log4rs::config::Config::builder()
        .appender(
            log4rs::config::Appender::builder()
                .build("stdout", Box::new(stdout_appender)),
        )
        .build(
            log4rs::config::Root::builder()
                .appender("stdout")
                .build(log::LevelFilter::Info),
        );

    match config {
        Ok(config) => {
            if let Err(init_err) = log4rs::init_config(config) {
                eprintln!(
                    "ERROR: Failed to initialize fallback logger: {}. No logging will be available.",
                    init_err
                );
            } else {
                log::warn!(
                    "attributionlib logging initialized using basic fallback (stdout, Info level)."
                );
            }
        }
        Err(build_err) => {
            eprintln!(
                "ERROR: Failed to build fallback logging configuration: {}. No logging will be available.",
                build_err
            );
        }
    }
}
