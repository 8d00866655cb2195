use anyhow::{Context, Result};
use env_logger::{Builder, Env, Logger, Target, WriteStyle};
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::OpenOptions;
use std::path::Path;

/// Console for warnings and errors (or whatever `RUST_LOG` asks for),
/// plus an append-only file that also keeps the debug trail.
struct Tee {
    console: Logger,
    file: Option<Logger>,
}

impl Log for Tee {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata) || self.file.as_ref().is_some_and(|f| f.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        self.console.log(record);
        if let Some(file) = &self.file {
            file.log(record);
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Some(file) = &self.file {
            file.flush();
        }
    }
}

pub fn init(log_file: Option<&Path>) -> Result<()> {
    let console = Builder::from_env(Env::default().default_filter_or("warn")).build();

    let file = match log_file {
        Some(path) => {
            let handle = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("log file \"{}\" could not be opened", path.display()))?;
            Some(
                Builder::new()
                    .filter_level(LevelFilter::Warn)
                    .filter_module(env!("CARGO_CRATE_NAME"), LevelFilter::Debug)
                    .write_style(WriteStyle::Never)
                    .target(Target::Pipe(Box::new(handle)))
                    .build(),
            )
        }
        None => None,
    };

    let max_level = file
        .as_ref()
        .map_or(console.filter(), |f| f.filter().max(console.filter()));

    log::set_boxed_logger(Box::new(Tee { console, file }))
        .context("logger already initialized")?;
    log::set_max_level(max_level);
    Ok(())
}
