//! Access-control merges
//!
//! Users, realms, tokens, TFA and password entries are union-merged between
//! the live install and the backup. The live `root@pam` account, its tokens
//! and TFA, and the built-in realms always win; a root ACL on `/` is always
//! present afterwards.

use super::files::write_dest;
use crate::error::{Error, Result};
use crate::section_config::SectionConfig;
use proxsafe_core::sys::{join_under, CONFIG_MODE, PRIVATE_MODE};
use proxsafe_core::Deps;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info};

pub const ROOT_USER: &str = "root@pam";

/// Root ACL guaranteed in PVE `user.cfg`
pub const PVE_ROOT_ACL: &str = "acl:1:/:root@pam:Administrator:";

/// Root ACL guaranteed in PBS `acl.cfg`
pub const PBS_ROOT_ACL: &str = "acl:1:/:root@pam:Admin";

const PVE_BUILTIN_REALMS: &[&str] = &["pam", "pve"];
const PBS_BUILTIN_REALMS: &[&str] = &["pam", "pbs"];

/// Order in which PVE `user.cfg` line kinds must appear
const PVE_KIND_ORDER: &[&str] = &["user", "token", "group", "pool", "role", "acl"];

fn is_root_id(id: &str) -> bool {
    id == ROOT_USER || id.starts_with("root@pam!")
}

/// Ordered keyed lines; later inserts with `replace` overwrite in place.
#[derive(Debug, Default)]
struct KeyedLines {
    entries: Vec<(String, String)>,
}

impl KeyedLines {
    fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    fn insert(&mut self, key: String, line: String, replace: bool) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) if replace => entry.1 = line,
            Some(_) => {}
            None => self.entries.push((key, line)),
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (_, line) in &self.entries {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

fn content_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
}

/// `kind:id` for most lines, `acl:<path>:<ugids>` for ACLs.
fn colon_key(line: &str) -> Option<(String, String)> {
    let fields: Vec<&str> = line.split(':').collect();
    match fields.as_slice() {
        ["acl", _propagate, path, ugids, ..] => Some((format!("acl:{}:{}", path, ugids), String::new())),
        [kind, id, ..] => Some((format!("{}:{}", kind, id), id.to_string())),
        _ => None,
    }
}

/// Merge colon-line files (`user.cfg` on PVE, `acl.cfg` on PBS).
fn merge_colon_lines(live: &str, staged: &str, root_acl: &str) -> KeyedLines {
    let mut merged = KeyedLines::default();

    for line in content_lines(live) {
        if let Some((key, id)) = colon_key(line) {
            if is_root_id(&id) {
                merged.insert(key, line.to_string(), true);
            }
        }
    }
    for line in content_lines(staged) {
        if let Some((key, id)) = colon_key(line) {
            if is_root_id(&id) {
                debug!("Dropping root entry from backup: {}", key);
                continue;
            }
            merged.insert(key, line.to_string(), true);
        }
    }
    for line in content_lines(live) {
        if let Some((key, _)) = colon_key(line) {
            merged.insert(key, line.to_string(), false);
        }
    }

    if let Some((key, _)) = colon_key(root_acl) {
        merged.insert(key, root_acl.to_string(), true);
    }
    merged
}

/// PVE `user.cfg`: root user and tokens from the live file, everything
/// else from the backup, kinds kept in dependency order.
pub fn merge_pve_user_cfg(live: &str, staged: &str) -> String {
    let mut merged = merge_colon_lines(live, staged, PVE_ROOT_ACL);
    if !merged.contains(&format!("user:{}", ROOT_USER)) {
        merged.insert(
            format!("user:{}", ROOT_USER),
            format!("user:{}:1:0::::::", ROOT_USER),
            false,
        );
    }
    merged.entries.sort_by_key(|(key, _)| {
        let kind = key.split(':').next().unwrap_or("");
        PVE_KIND_ORDER.iter().position(|k| *k == kind).unwrap_or(PVE_KIND_ORDER.len())
    });
    merged.render()
}

/// PBS `acl.cfg`
pub fn merge_pbs_acl(live: &str, staged: &str) -> String {
    merge_colon_lines(live, staged, PBS_ROOT_ACL).render()
}

/// Files keyed by a leading field (`shadow.cfg` by `:`, `token.cfg` by
/// whitespace).
pub fn merge_keyed_file(live: &str, staged: &str, key_of: fn(&str) -> &str) -> String {
    let mut merged = KeyedLines::default();
    for line in content_lines(live) {
        let key = key_of(line);
        if is_root_id(key) {
            merged.insert(key.to_string(), line.to_string(), true);
        }
    }
    for line in content_lines(staged) {
        let key = key_of(line);
        if !is_root_id(key) {
            merged.insert(key.to_string(), line.to_string(), true);
        }
    }
    for line in content_lines(live) {
        merged.insert(key_of(line).to_string(), line.to_string(), false);
    }
    merged.render()
}

fn first_colon_field(line: &str) -> &str {
    line.split(':').next().unwrap_or("").trim()
}

fn first_word(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

/// Section-config `domains.cfg`: built-in realms stay as installed.
pub fn merge_domains(live: &str, staged: &str, builtin: &[&str]) -> String {
    let live = SectionConfig::parse(live);
    let staged = SectionConfig::parse(staged);
    let mut merged = SectionConfig::default();

    for section in &live.sections {
        if builtin.contains(&section.id.as_str()) {
            merged.upsert(section.clone());
        }
    }
    for section in &staged.sections {
        if builtin.contains(&section.id.as_str()) {
            continue;
        }
        merged.upsert(section.clone());
    }
    for section in &live.sections {
        if merged.find(&section.id).is_none() {
            merged.upsert(section.clone());
        }
    }
    merged.to_string()
}

/// PBS `user.cfg`: sections for users and tokens.
pub fn merge_pbs_user_cfg(live: &str, staged: &str) -> String {
    let live = SectionConfig::parse(live);
    let staged = SectionConfig::parse(staged);
    let mut merged = SectionConfig::default();

    for section in live.sections.iter().filter(|s| is_root_id(&s.id)) {
        merged.upsert(section.clone());
    }
    for section in staged.sections.iter().filter(|s| !is_root_id(&s.id)) {
        merged.upsert(section.clone());
    }
    for section in &live.sections {
        if merged.get(&section.kind, &section.id).is_none() {
            merged.upsert(section.clone());
        }
    }
    merged.sections.sort_by_key(|s| if s.kind == "user" { 0 } else { 1 });
    merged.to_string()
}

fn json_object(text: &str, path: &Path) -> Result<Map<String, Value>> {
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::apply(
            "access_control",
            format!("{} is not a JSON object", path.display()),
        )),
    }
}

/// Flat JSON maps keyed by user or token id (`token.shadow`,
/// `shadow.json`).
fn merge_json_entries(live: &Map<String, Value>, staged: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    for (key, value) in live.iter().filter(|(k, _)| is_root_id(k)) {
        merged.insert(key.clone(), value.clone());
    }
    for (key, value) in staged.iter().filter(|(k, _)| !is_root_id(k)) {
        merged.insert(key.clone(), value.clone());
    }
    for (key, value) in live {
        merged.entry(key.clone()).or_insert_with(|| value.clone());
    }
    merged
}

pub fn merge_json_map(live: &str, staged: &str, path: &Path) -> Result<String> {
    let merged = merge_json_entries(&json_object(live, path)?, &json_object(staged, path)?);
    Ok(serde_json::to_string_pretty(&Value::Object(merged))?)
}

/// TFA JSON: per-user entries under `users` merge like a JSON map; other
/// top-level settings come from the backup.
pub fn merge_tfa_json(live: &str, staged: &str, path: &Path) -> Result<String> {
    let live = json_object(live, path)?;
    let staged = json_object(staged, path)?;
    let users_of = |m: &Map<String, Value>| m.get("users").and_then(Value::as_object).cloned().unwrap_or_default();

    let mut merged = Map::new();
    for (key, value) in staged.iter().chain(live.iter()) {
        if key == "users" {
            continue;
        }
        merged.entry(key.clone()).or_insert_with(|| value.clone());
    }
    let users = merge_json_entries(&users_of(&live), &users_of(&staged));
    if !users.is_empty() || live.contains_key("users") || staged.contains_key("users") {
        merged.insert("users".to_string(), Value::Object(users));
    }
    Ok(serde_json::to_string_pretty(&Value::Object(merged))?)
}

/// How one access-control file is merged
#[derive(Debug, Clone, Copy)]
enum Merge {
    PveUsers,
    PbsUsers,
    PbsAcl,
    Domains(&'static [&'static str]),
    ColonKeyed,
    WordKeyed,
    JsonMap,
    Tfa,
}

fn merge_text(kind: Merge, live: &str, staged: &str, path: &Path) -> Result<String> {
    Ok(match kind {
        Merge::PveUsers => merge_pve_user_cfg(live, staged),
        Merge::PbsUsers => merge_pbs_user_cfg(live, staged),
        Merge::PbsAcl => merge_pbs_acl(live, staged),
        Merge::Domains(builtin) => merge_domains(live, staged, builtin),
        Merge::ColonKeyed => merge_keyed_file(live, staged, first_colon_field),
        Merge::WordKeyed => merge_keyed_file(live, staged, first_word),
        Merge::JsonMap => merge_json_map(live, staged, path)?,
        Merge::Tfa => {
            // Older PVE releases keep tfa.cfg as colon lines
            if staged.trim_start().starts_with('{') || staged.trim().is_empty() {
                merge_tfa_json(live, staged, path)?
            } else {
                merge_keyed_file(live, staged, first_colon_field)
            }
        }
    })
}

const PVE_FILES: &[(&str, Merge, u32)] = &[
    ("etc/pve/domains.cfg", Merge::Domains(PVE_BUILTIN_REALMS), CONFIG_MODE),
    ("etc/pve/user.cfg", Merge::PveUsers, CONFIG_MODE),
    ("etc/pve/priv/shadow.cfg", Merge::ColonKeyed, PRIVATE_MODE),
    ("etc/pve/priv/token.cfg", Merge::WordKeyed, PRIVATE_MODE),
    ("etc/pve/priv/tfa.cfg", Merge::Tfa, PRIVATE_MODE),
];

const PBS_FILES: &[(&str, Merge, u32)] = &[
    ("etc/proxmox-backup/domains.cfg", Merge::Domains(PBS_BUILTIN_REALMS), CONFIG_MODE),
    ("etc/proxmox-backup/user.cfg", Merge::PbsUsers, CONFIG_MODE),
    ("etc/proxmox-backup/acl.cfg", Merge::PbsAcl, CONFIG_MODE),
    ("etc/proxmox-backup/token.shadow", Merge::JsonMap, PRIVATE_MODE),
    ("etc/proxmox-backup/tfa.json", Merge::Tfa, PRIVATE_MODE),
    ("etc/proxmox-backup/shadow.json", Merge::JsonMap, PRIVATE_MODE),
];

fn apply_files(
    deps: &Deps,
    staging: &Path,
    dest: &Path,
    files: &[(&str, Merge, u32)],
) -> Result<Vec<String>> {
    let fs = deps.fs.as_ref();
    let mut merged_files = Vec::new();

    for (rel, kind, mode) in files {
        let staged_path = join_under(staging, Path::new(rel));
        if !fs.exists(&staged_path) {
            continue;
        }
        let live_path = join_under(dest, Path::new(rel));
        let staged = fs
            .read_to_string(&staged_path)
            .map_err(|e| Error::path_io("Failed to read", &staged_path, e))?;
        let live = match fs.read_to_string(&live_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::path_io("Failed to read", &live_path, e)),
        };

        let merged = merge_text(*kind, &live, &staged, &live_path)?;
        write_dest(deps, &live_path, merged.as_bytes(), *mode)?;
        info!("Merged {}", live_path.display());
        merged_files.push(rel.to_string());
    }
    Ok(merged_files)
}

/// Merge PVE access-control files. Returns the relative paths written.
pub fn apply_pve_access(deps: &Deps, staging: &Path, dest: &Path) -> Result<Vec<String>> {
    apply_files(deps, staging, dest, PVE_FILES)
}

/// Merge PBS access-control files. Returns the relative paths written.
pub fn apply_pbs_access(deps: &Deps, staging: &Path, dest: &Path) -> Result<Vec<String>> {
    apply_files(deps, staging, dest, PBS_FILES)
}
