//! CLI status reader.
//!
//! # Responsibility
//! - Print the core version.
//! - Given a store path, print the persisted sync status of one list pair
//!   in that store (`default` unless a pair id follows the path).

use listsync_core::config::LinkingConfig;
use listsync_core::repo::item_repo::{SourceItemRepository, SqliteSourceItemRepository};
use listsync_core::repo::DEFAULT_PAIR_ID;
use listsync_core::sync::linker::ItemLinker;
use listsync_core::{core_version, open_db, Side, SyncStatus};
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("listsync_core version={}", core_version());

    let mut args = std::env::args().skip(1);
    let Some(store_path) = args.next() else {
        return ExitCode::SUCCESS;
    };
    let pair_id = args.next().unwrap_or_else(|| DEFAULT_PAIR_ID.to_string());

    match print_status(&store_path, &pair_id) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn print_status(store_path: &str, pair_id: &str) -> Result<(), String> {
    let conn = open_db(store_path).map_err(|err| err.to_string())?;
    let status = SyncStatus::load(&conn, pair_id).map_err(|err| err.to_string())?;

    println!("pair_id={pair_id}");
    match status.last_cycle_at {
        Some(at) => println!("last_cycle_at={at}"),
        None => println!("last_cycle_at=never"),
    }
    println!("pending_error_count={}", status.pending_error_count);
    println!("link_coverage_ratio={:.3}", status.link_coverage_ratio);

    let items = SqliteSourceItemRepository::for_pair(&conn, pair_id);
    let unlinked_a = items
        .list_unlinked_items(Side::A)
        .map_err(|err| err.to_string())?;
    let unlinked_b = items
        .list_unlinked_items(Side::B)
        .map_err(|err| err.to_string())?;
    let summary = ItemLinker::new(LinkingConfig::default()).summary(&unlinked_a, &unlinked_b);
    println!(
        "unlinked_a={} unlinked_b={} potential_exact_matches={} duplicate_names_a={} duplicate_names_b={}",
        summary.unlinked_a,
        summary.unlinked_b,
        summary.potential_exact_matches,
        summary.duplicate_names_a,
        summary.duplicate_names_b
    );
    Ok(())
}
