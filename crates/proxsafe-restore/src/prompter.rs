//! Operator questions asked by a restore session

use crate::categories::Category;
use crate::error::{Error, Result};
use crate::plan::{RestoreMode, RestorePlan};
use async_trait::async_trait;
use proxsafe_core::ui::{confirm, select_menu, Ui, ABORT};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The three decisions a restore needs from the operator.
#[async_trait]
pub trait RestorePrompter: Send + Sync {
    async fn restore_mode(&self, cancel: &CancellationToken) -> Result<RestoreMode>;

    async fn select_categories(
        &self,
        cancel: &CancellationToken,
        available: &[&'static Category],
    ) -> Result<Vec<&'static Category>>;

    async fn confirm_restore(&self, cancel: &CancellationToken, plan: &RestorePlan) -> Result<bool>;
}

/// [`RestorePrompter`] on top of the line-oriented [`Ui`]
pub struct UiPrompter {
    ui: Arc<dyn Ui>,
}

impl UiPrompter {
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self { ui }
    }
}

/// Parse `1,3 5` or `all` against `count` items. `None` on anything invalid.
fn parse_selection(input: &str, count: usize) -> Option<Vec<usize>> {
    let input = input.trim();
    if input.eq_ignore_ascii_case("all") || input == "*" {
        return Some((0..count).collect());
    }
    let mut picked = Vec::new();
    for token in input.split(|c: char| c == ',' || c.is_whitespace()).filter(|t| !t.is_empty()) {
        let n: usize = token.parse().ok()?;
        if n == 0 || n > count {
            return None;
        }
        if !picked.contains(&(n - 1)) {
            picked.push(n - 1);
        }
    }
    if picked.is_empty() {
        None
    } else {
        Some(picked)
    }
}

#[async_trait]
impl RestorePrompter for UiPrompter {
    async fn restore_mode(&self, cancel: &CancellationToken) -> Result<RestoreMode> {
        let items = vec![
            "Full restore (every compatible category)".to_string(),
            "Custom restore (choose categories)".to_string(),
        ];
        match select_menu(self.ui.as_ref(), cancel, "Select restore mode:", &items).await {
            Ok(0) => Ok(RestoreMode::Full),
            Ok(_) => Ok(RestoreMode::Custom),
            Err(e) if e.is_abort() => Err(Error::Aborted),
            Err(e) => Err(e.into()),
        }
    }

    async fn select_categories(
        &self,
        cancel: &CancellationToken,
        available: &[&'static Category],
    ) -> Result<Vec<&'static Category>> {
        loop {
            self.ui.println("Select categories to restore:");
            for (i, category) in available.iter().enumerate() {
                let tag = if category.export_only { " [export only]" } else { "" };
                self.ui.println(&format!(
                    "  [{}] {} ({}){}",
                    i + 1,
                    category.name,
                    category.id,
                    tag
                ));
            }
            self.ui.println("  [0] Abort");

            let answer = self
                .ui
                .read_line(cancel, "Categories (e.g. 1,3 or all): ")
                .await?;
            if answer.trim() == ABORT {
                return Err(Error::Aborted);
            }
            match parse_selection(&answer, available.len()) {
                Some(indices) => return Ok(indices.into_iter().map(|i| available[i]).collect()),
                None => self.ui.println("Invalid selection, try again."),
            }
        }
    }

    async fn confirm_restore(&self, cancel: &CancellationToken, plan: &RestorePlan) -> Result<bool> {
        self.ui.println("Restore plan:");
        for line in plan.summary() {
            self.ui.println(&format!("  {}", line));
        }
        match confirm(self.ui.as_ref(), cancel, "Proceed with restore?", false).await {
            Ok(answer) => Ok(answer),
            Err(e) if e.is_abort() => Err(Error::Aborted),
            Err(e) => Err(e.into()),
        }
    }
}
