#[macro_use]
extern crate log;
extern crate simplelog;
use simplelog::*;

use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

mod config;
mod console;
mod csvout;
mod database;
mod decode;
mod error;
mod modbus;
mod pivot;
mod registers;
mod session;

use crate::config::{SinkKind, DEFAULT_CONFIG_FILE};
use crate::console::ConsoleOptions;
use crate::error::{PollError, Result};
use crate::modbus::{BlockReader, RtuLink};
use crate::pivot::PivotTable;
use crate::session::{PollPass, PollSession};

/// Reads a Sofar inverter over Modbus RTU and reports or stores one pass.
#[derive(Debug, Parser)]
#[command(name = "sofarpoll", version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, env = "SOFARPOLL_CONFIG")]
    config: PathBuf,

    /// Debug output on the console
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors on the console
    #[arg(short, long)]
    quiet: bool,

    /// Override `[output] sink`
    #[arg(long)]
    sink: Option<String>,

    /// Print zero readings too
    #[arg(long)]
    all: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Push a pivoted CSV into the database
    Import { csv: PathBuf },
}

fn logging_init(level: LevelFilter, log_path: Option<&Path>) {
    let conf = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_target_level(LevelFilter::Off)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        conf.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];

    let mut logfile_error: Option<String> = None;
    if let Some(log_path) = log_path {
        match OpenOptions::new().create(true).append(true).open(log_path) {
            Ok(logfile) => loggers.push(WriteLogger::new(LevelFilter::Info, conf, logfile)),
            Err(e) => {
                logfile_error = Some(format!(
                    "Error creating/opening log file: {:?}: {:?}",
                    log_path, e
                ));
            }
        }
    }

    if let Err(e) = CombinedLogger::init(loggers) {
        eprintln!("Cannot initialize logging subsystem: {}", e);
    }
    if let Some(e) = logfile_error {
        error!("{}", e);
        warn!("Will do console logging only...");
    }
}

fn console_level(cli: &Cli, configured: LevelFilter) -> LevelFilter {
    if cli.verbose {
        LevelFilter::Debug
    } else if cli.quiet {
        LevelFilter::Warn
    } else {
        configured
    }
}

fn fail(e: PollError) -> ! {
    error!("{}", e);
    process::exit(e.exit_code());
}

fn store(config: &config::Config, sink: SinkKind, pass: &PollPass) -> Result<()> {
    match sink {
        SinkKind::Console => Ok(()),
        SinkKind::PivotCsv => {
            csvout::write_pivot_csv(&PivotTable::from_readings(&pass.readings), &config.csv_path)
        }
        SinkKind::WideCsv => csvout::write_wide_csv(pass, &config.csv_path),
        SinkKind::NarrowCsv => csvout::write_narrow_csv(pass, &config.csv_path),
        SinkKind::Postgres => {
            let mut db = database::PgSink::connect(&config.postgres)?;
            db.store_pass(pass).map(|_| ())
        }
    }
}

fn import(config: &config::Config, csv: &Path) -> Result<()> {
    let table = csvout::read_pivot_csv(csv)?;
    info!(
        "📥 importing {} rows x {} columns from {}",
        table.rows.len(),
        table.columns.len(),
        csv.display()
    );
    let mut db = database::PgSink::connect(&config.postgres)?;
    db.store_pivot(chrono::Local::now().naive_local(), &table)?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let config = match config::Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            logging_init(console_level(&cli, LevelFilter::Info), None);
            fail(e);
        }
    };
    logging_init(
        console_level(&cli, config.log_level),
        config.log_file.as_deref(),
    );
    info!("Welcome to sofarpoll (Sofar inverter Modbus poller)");

    if let Some(Command::Import { csv }) = &cli.command {
        if let Err(e) = import(&config, csv) {
            fail(e);
        }
        return;
    }

    let sink = match &cli.sink {
        Some(name) => match SinkKind::parse(name) {
            Some(s) => s,
            None => fail(PollError::Config(format!("unknown sink {:?}", name))),
        },
        None => config.sink,
    };

    let map = match registers::load(
        &config.registers.file,
        &config.registers.columns,
        config.registers.max_register,
    ) {
        Ok(m) => m,
        Err(e) => fail(e),
    };
    if map.is_empty() {
        warn!(
            "{}: no register definitions loaded, nothing will be decoded",
            config.registers.file.display()
        );
    }

    let link = match RtuLink::open(&config.serial) {
        Ok(l) => l,
        Err(e) => fail(e),
    };
    let reader = BlockReader::new(link, config.poll.attempts, config.poll.block_delay);
    let pass = {
        let mut session = PollSession::new(&map, reader, config.poll.block_size);
        session.run(&config.poll.plan)
    };

    let opts = ConsoleOptions {
        zero_suppress: config.poll.zero_suppress && !cli.all,
        always_report: config.poll.always_report.clone(),
    };
    if let Err(e) = console::render(&pass.readings, &opts, io::stdout().lock()) {
        error!("cannot write report: {}", e);
    }

    if let Err(e) = store(&config, sink, &pass) {
        fail(e);
    }
    info!("done");
}
