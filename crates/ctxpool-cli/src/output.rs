//! Terminal rendering of simulation results

use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL};

use crate::simulate::SimulationSummary;

/// Per-service stats table
pub fn stats_table(summary: &SimulationSummary) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Service",
            "Capacity",
            "Created",
            "Borrowed",
            "Available",
            "Destroyed",
            "Utilization",
        ]);

    for (service, stats) in &summary.stats {
        let created = summary.created.get(service).copied().unwrap_or_default();
        table.add_row(vec![
            Cell::new(service),
            Cell::new(stats.capacity()),
            Cell::new(created),
            Cell::new(stats.borrowed()),
            Cell::new(stats.available()),
            Cell::new(stats.destroyed()),
            Cell::new(format!("{:.1}%", stats.utilization() * 100.0)),
        ]);
    }
    table
}

pub fn print_summary(summary: &SimulationSummary) {
    println!("{}", stats_table(summary));
    println!(
        "{} units run, {} failed, {} connections returned, {} destroyed, {} cleanup sweeps",
        summary.units_run,
        summary.units_failed,
        summary.returned,
        summary.destroyed,
        summary.cleanups
    );
    if let Some(fatal) = &summary.fatal {
        println!("stopped early: {fatal}");
    }
}

#[cfg(test)]
mod tests {
    use ctxpool_connection::PoolStats;
    use ctxpool_core::ServiceId;

    use super::*;

    #[test]
    fn test_stats_table_has_a_row_per_service() {
        let mut summary = SimulationSummary::default();
        for name in ["cache.default", "db.default"] {
            summary.stats.insert(ServiceId::from(name), PoolStats::new(4));
            summary.created.insert(ServiceId::from(name), 2);
        }

        let rendered = stats_table(&summary).to_string();
        assert!(rendered.contains("db.default"));
        assert!(rendered.contains("cache.default"));
        assert!(rendered.contains("Utilization"));
        assert!(rendered.contains("0.0%"));
    }
}
