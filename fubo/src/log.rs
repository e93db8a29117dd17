// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use log::LevelFilter;
use log4rs::append::console;
use log4rs::append::rolling_file::policy::compound::{
    roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
};
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

use crate::error::{Error, ErrorKind};

const LOG_FILE_SIZE: u64 = 16 * 1024 * 1024;
const ROLLER_PATTERN: &str = ".{}.gz";
const ROLLER_COUNT: u32 = 10;

const STDOUT_NAME: &str = "stdout";
const ROLLER_NAME: &str = "roller";

/// Map the cli `verbose` option, 0 (quiet) to 5 (trace), onto a level
/// filter.
fn get_log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Init log4rs with a console appender and, when `log_file` is given, a
/// size-rolling gzip file appender next to it.
///
/// # Errors
///
/// Returns error if the appenders cannot be built.
pub fn init_log(verbose: u8, log_file: Option<&Path>) -> Result<(), Error> {
    let stdout = console::ConsoleAppender::builder()
        .target(console::Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{d} {h({l})} - {m}{n}")))
        .build();

    let log_level = get_log_level(verbose);
    let mut config_builder =
        Config::builder().appender(Appender::builder().build(STDOUT_NAME, Box::new(stdout)));
    let mut appenders = vec![STDOUT_NAME];

    if let Some(log_file) = log_file {
        let roller_pattern = log_file.to_str().ok_or_else(|| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("Invalid log file {log_file:?}"),
            )
        })?;
        let roller_pattern = roller_pattern.to_string() + ROLLER_PATTERN;
        let roller = FixedWindowRoller::builder()
            .build(&roller_pattern, ROLLER_COUNT)
            .map_err(|err| {
                Error::from_string(
                    ErrorKind::LoggerError,
                    format!("Failed to init roller pattern, {err:?}"),
                )
            })?;
        let rolling_policy = Box::new(CompoundPolicy::new(
            Box::new(SizeTrigger::new(LOG_FILE_SIZE)),
            Box::new(roller),
        ));
        let requests = RollingFileAppender::builder()
            .build(log_file, rolling_policy)
            .map_err(|err| {
                Error::from_string(
                    ErrorKind::LoggerError,
                    format!("Failed to init roller appender, {err:?}"),
                )
            })?;
        config_builder =
            config_builder.appender(Appender::builder().build(ROLLER_NAME, Box::new(requests)));
        appenders.push(ROLLER_NAME);
    }

    let config = config_builder
        .build(Root::builder().appenders(appenders).build(log_level))
        .map_err(|err| {
            Error::from_string(
                ErrorKind::LoggerError,
                format!("Failed to build log4rs config, {err:?}"),
            )
        })?;

    log4rs::init_config(config).map_err(|err| {
        Error::from_string(
            ErrorKind::LoggerError,
            format!("Failed to init log4rs, {err:?}"),
        )
    })?;
    Ok(())
}
