//! Category catalog listing

use anyhow::Result;
use proxsafe_backup::SystemType;
use proxsafe_restore::categories::{for_system, CATALOG};
use proxsafe_restore::Category;
use tabled::{settings::Style, Table, Tabled};

use crate::cli::{CategoriesArgs, SystemArg};
use crate::output;

#[derive(Tabled)]
struct CategoryRow {
    id: &'static str,
    name: &'static str,
    #[tabled(rename = "type")]
    kind: String,
    #[tabled(rename = "export only")]
    export_only: &'static str,
    paths: String,
}

impl From<&Category> for CategoryRow {
    fn from(c: &Category) -> Self {
        Self {
            id: c.id,
            name: c.name,
            kind: c.kind.to_string(),
            export_only: if c.export_only { "yes" } else { "" },
            paths: c.paths.join(" "),
        }
    }
}

fn selected(system: Option<SystemArg>) -> Vec<&'static Category> {
    match system {
        Some(SystemArg::Pve) => for_system(SystemType::Pve),
        Some(SystemArg::Pbs) => for_system(SystemType::Pbs),
        None => CATALOG.iter().collect(),
    }
}

pub fn run(args: CategoriesArgs) -> Result<()> {
    let categories = selected(args.system);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&categories)?);
        return Ok(());
    }

    if categories.is_empty() {
        output::warning("No categories");
        return Ok(());
    }
    let mut table = Table::new(categories.iter().map(|c| CategoryRow::from(*c)));
    table.with(Style::sharp());
    println!("{}", table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxsafe_restore::CategoryType;

    #[test]
    fn test_system_filter() {
        assert_eq!(selected(None).len(), CATALOG.len());
        assert!(selected(Some(SystemArg::Pbs))
            .iter()
            .all(|c| c.kind != CategoryType::Pve));
        assert!(selected(Some(SystemArg::Pve))
            .iter()
            .any(|c| c.id == proxsafe_restore::categories::PVE_CLUSTER));
    }

    #[test]
    fn test_row_marks_export_only() {
        let zfs = proxsafe_restore::categories::find(proxsafe_restore::categories::ZFS).unwrap();
        let row = CategoryRow::from(zfs);
        assert_eq!(row.export_only, "yes");
        assert_eq!(row.kind, "common");
    }
}
