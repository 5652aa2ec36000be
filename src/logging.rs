// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Logging setup for the engine. The core itself only ever calls
//! `log::{trace, debug, info, warn, error}`; it is up to the embedding
//! application to install a logger. This module provides the dispatcher the
//! engine's own test harness and examples use.

/// Install a `fern`-backed logger writing to stdout.
///
/// `verbosity` follows the usual CLI convention: `0` = info, `1` = debug,
/// `2+` = trace.
pub fn init_logger(verbosity: u8) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} line {}][{}] {}",
                record.target(),
                record.line().unwrap_or(0),
                record.level(),
                message
            ))
        })
        .level(match verbosity {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
