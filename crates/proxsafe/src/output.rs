//! Terminal output utilities

use console::style;
use proxsafe_restore::{NotCommitted, Outcome, RestoreReport};
use tabled::{settings::Style, Table, Tabled};

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", style("✓").green().bold(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

/// Print a warning message
pub fn warning(msg: &str) {
    eprintln!("{} {}", style("⚠").yellow().bold(), msg);
}

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", style("ℹ").blue().bold(), msg);
}

/// Print a header
pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold().underlined());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", style(key).dim(), value);
}

#[derive(Tabled)]
struct CategoryRow {
    category: String,
    result: String,
    notes: String,
}

fn report_rows(report: &RestoreReport) -> Vec<CategoryRow> {
    report
        .categories
        .iter()
        .map(|c| CategoryRow {
            category: c.id.to_string(),
            result: match &c.outcome {
                Outcome::Applied => style("applied").green().to_string(),
                Outcome::Skipped(reason) => format!("skipped: {}", reason),
                Outcome::Failed(message) => style(format!("failed: {}", message)).red().to_string(),
            },
            notes: c.notes.join("; "),
        })
        .collect()
}

/// Print what a restore session did
pub fn print_report(report: &RestoreReport) {
    header("Restore Report");
    if report.dry_run {
        info("Dry run: nothing on this host was changed");
    }

    if !report.categories.is_empty() {
        let mut table = Table::new(report_rows(report));
        table.with(Style::sharp());
        println!("{}", table);
    }

    if !report.plan.export_categories.is_empty() {
        let ids: Vec<&str> = report.plan.export_categories.iter().map(|c| c.id).collect();
        kv("Export only", &ids.join(", "));
    }
    if let Some(dir) = &report.export_dir {
        kv("Export directory", &dir.display().to_string());
    }
    if let Some(archive) = &report.safety_backup {
        kv("Safety backup", &archive.display().to_string());
        kv("Undo with", &format!("proxsafe rollback-snapshot {}", archive.display()));
    }
    if let Some(diag) = &report.network {
        print_not_committed(diag);
    }
}

/// Explain an uncommitted network change and how to keep it
pub fn print_not_committed(diag: &NotCommitted) {
    println!();
    warning("Network changes were NOT committed; the previous configuration will be restored");
    kv("Rollback at", &diag.deadline.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    if let Some(iface) = &diag.interface {
        kv(
            "Management interface",
            &format!(
                "{} ({} -> {})",
                iface,
                diag.pre_ip.as_deref().unwrap_or("?"),
                diag.post_ip.as_deref().unwrap_or("?")
            ),
        );
    }
    kv("Rollback log", &diag.log.display().to_string());
    kv(
        "To keep the new configuration",
        &format!("rm {} before the deadline", diag.marker.display()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxsafe_backup::{Manifest, SystemType};
    use proxsafe_restore::categories::{find, CRON, SSH};
    use proxsafe_restore::{CategoryReport, RestoreMode, RestorePlan};

    #[test]
    fn test_report_rows() {
        let plan = RestorePlan::build(
            &Manifest::default(),
            RestoreMode::Custom,
            &[find(SSH).unwrap(), find(CRON).unwrap()],
            SystemType::Pve,
            None,
        );
        let report = RestoreReport {
            plan,
            categories: vec![
                CategoryReport {
                    id: SSH,
                    outcome: Outcome::Applied,
                    notes: vec!["sshd reloaded".to_string()],
                },
                CategoryReport {
                    id: CRON,
                    outcome: Outcome::Skipped("nothing staged".to_string()),
                    notes: Vec::new(),
                },
            ],
            safety_backup: None,
            export_dir: None,
            network: None,
            dry_run: false,
        };

        let rows = report_rows(&report);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].category, "ssh");
        assert!(rows[0].result.contains("applied"));
        assert_eq!(rows[0].notes, "sshd reloaded");
        assert_eq!(rows[1].result, "skipped: nothing staged");
    }
}
