//! Target preview (spec §4.6): resolve a list of symbolic targets to
//! destinations and render them, either as JSON or through a caller-supplied
//! text template. Shares `resolver::resolve` so preview output matches
//! actual execution exactly.

use crate::resolver::{self, ResolveError};
use serde::Serialize;
use spot_ast::{Destination, InventoryData, Overrides, Playbook};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed to encode destinations as JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct PreviewEntry {
    name: String,
    host: String,
    port: u16,
    user: Option<String>,
}

/// Resolve every name in `targets` and render the combined, order-preserving
/// destination list. With no `template`, produces pretty JSON; otherwise
/// applies the template once per destination, joined by newlines, with
/// `{{host}}`, `{{port}}`, `{{user}}`, `{{name}}` placeholders.
pub fn preview(
    playbook: &Playbook,
    inventory: Option<&InventoryData>,
    overrides: &Overrides,
    targets: &[String],
    template: Option<&str>,
) -> Result<String, GenError> {
    let mut entries = Vec::new();
    for name in targets {
        let resolved = resolver::resolve(playbook, inventory, overrides, None, name)?;
        entries.extend(resolved.into_iter().map(|d| (name.clone(), d)));
    }

    match template {
        Some(tpl) => Ok(entries
            .iter()
            .map(|(name, d)| render_entry_template(tpl, name, d))
            .collect::<Vec<_>>()
            .join("\n")),
        None => {
            let preview: Vec<PreviewEntry> = entries
                .into_iter()
                .map(|(name, d)| PreviewEntry {
                    name,
                    host: d.host,
                    port: d.effective_port(),
                    user: d.user,
                })
                .collect();
            Ok(serde_json::to_string_pretty(&preview)?)
        }
    }
}

fn render_entry_template(template: &str, name: &str, dest: &Destination) -> String {
    template
        .replace("{{name}}", name)
        .replace("{{host}}", &dest.host)
        .replace("{{port}}", &dest.effective_port().to_string())
        .replace("{{user}}", dest.user.as_deref().unwrap_or(""))
}
