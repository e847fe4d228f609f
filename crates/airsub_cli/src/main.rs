//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `airsub_core` linkage and report its version.
//! - Optionally open a database and list active subscriptions over cells.
//!
//! Usage: `airsub_cli [DB_PATH [CELL_ID ...]]`, cell ids in decimal or `0x` hex.
//! Set `AIRSUB_LOG_DIR` to an absolute directory to enable file logging.

use airsub_core::{
    core_version, default_log_level, init_logging, open_db, CellId, LogConfig, QueryContext,
    SqliteSubscriptionRepository, SubscriptionRepository,
};
use log::info;
use std::process::ExitCode;
use std::time::Duration;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    println!("airsub_core version={}", core_version());

    if let Some(log_dir) = std::env::var_os("AIRSUB_LOG_DIR") {
        if let Err(message) = init_logging(&LogConfig::new(default_log_level(), log_dir)) {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    }

    let mut args = std::env::args().skip(1);
    let Some(db_path) = args.next() else {
        return ExitCode::SUCCESS;
    };

    let cells = match args.map(|arg| parse_cell(&arg)).collect::<Result<Vec<_>, _>>() {
        Ok(cells) => cells,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    match run(&db_path, &cells) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(db_path: &str, cells: &[CellId]) -> Result<(), String> {
    let conn = open_db(db_path).map_err(|err| format!("cannot open {db_path}: {err}"))?;
    let schema_version: u32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .map_err(|err| err.to_string())?;
    println!("schema_version={schema_version}");

    if cells.is_empty() {
        return Ok(());
    }

    let repo = SqliteSubscriptionRepository::try_new(&conn).map_err(|err| err.to_string())?;
    let ctx = QueryContext::with_timeout(QUERY_TIMEOUT);
    let found = repo
        .search_subscriptions(&ctx, cells)
        .map_err(|err| err.to_string())?;
    info!(
        "event=cli_search module=cli status=ok cells={} found={}",
        cells.len(),
        found.len()
    );
    let json = serde_json::to_string_pretty(&found).map_err(|err| err.to_string())?;
    println!("{json}");
    Ok(())
}

fn parse_cell(arg: &str) -> Result<CellId, String> {
    let parsed = match arg.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => arg.parse::<u64>(),
    };
    parsed
        .map(CellId::new)
        .map_err(|_| format!("invalid cell id `{arg}`"))
}
