use std::{fs, path::Path};

use anyhow::Context;
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};

/// Initialize terminal logging at `level`, plus a debug-level log file when `file` is set.
pub fn init(level: LevelFilter, file: Option<&Path>) -> anyhow::Result<()> {
    let config = ConfigBuilder::new()
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    if let Some(path) = file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {:?}", parent))?;
        }
        let out = fs::File::create(path)
            .with_context(|| format!("Failed to create log file {:?}", path))?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, config, out));
    }

    CombinedLogger::init(loggers).context("Failed to initialize logger")?;
    Ok(())
}
