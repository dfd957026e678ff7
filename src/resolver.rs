//! Target resolver (spec §4.2): map a symbolic target name to a
//! deduplicated, ordered list of destinations.

use spot_ast::{Destination, InventoryData, Overrides, Playbook, Target};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("hosts for target {0} not found")]
    NotFound(String),
    #[error("invalid port in target {0:?}: {1}")]
    BadPort(String, std::num::ParseIntError),
}

/// Resolve `name` against the playbook's `targets` map and, failing that,
/// against the inventory and raw-address fallbacks (spec §4.2).
///
/// `task_user` is the task's own default user, if any -- it sits between
/// `overrides.user` and `playbook.user` in the precedence chain (spec §4.2
/// "User precedence"). Callers outside task context (e.g. `gen`'s preview)
/// pass `None`.
pub fn resolve(
    playbook: &Playbook,
    inventory: Option<&InventoryData>,
    overrides: &Overrides,
    task_user: Option<&str>,
    name: &str,
) -> Result<Vec<Destination>, ResolveError> {
    let default_user = overrides
        .user
        .clone()
        .or_else(|| task_user.map(|s| s.to_string()))
        .or_else(|| playbook.user.clone())
        .unwrap_or_else(whoami_fallback);

    let mut found;

    if let Some(target) = playbook.targets.get(name) {
        // A declared playbook target: empty result is a hard error (§4.2
        // step 5), never falls through to the raw-address parser.
        found = resolve_playbook_target(target, inventory);
        if found.is_empty() {
            return Err(ResolveError::NotFound(name.to_string()));
        }
    } else {
        found = Vec::new();
        if let Some(inv) = inventory {
            if !inv.group(name).is_empty() {
                found = inv.group(name).to_vec();
            } else if let Some(tagged) = resolve_by_tag(inv, name) {
                found = tagged;
            } else if let Some(named) = resolve_by_name(inv, name) {
                found = vec![named];
            } else if let Some(hosted) = resolve_by_host(inv, name) {
                found = vec![hosted];
            }
        }
        if found.is_empty() {
            found = vec![parse_raw_address(name, &default_user)?];
        }
    }

    for dest in found.iter_mut() {
        apply_user_precedence(dest, overrides, &default_user);
    }

    Ok(dedup(found))
}

fn whoami_fallback() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

fn resolve_playbook_target(target: &Target, inventory: Option<&InventoryData>) -> Vec<Destination> {
    let mut out = Vec::new();
    out.extend(target.hosts.iter().cloned());

    if let Some(inv) = inventory {
        for name in &target.names {
            if let Some(found) = inv
                .all()
                .iter()
                .find(|d| d.display_name().eq_ignore_ascii_case(name))
            {
                out.push(found.clone());
            }
        }
        for group in &target.groups {
            out.extend(inv.group(group).iter().cloned());
        }
        for tag in &target.tags {
            out.extend(
                inv.all()
                    .iter()
                    .filter(|d| d.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
                    .cloned(),
            );
        }
    }
    out
}

fn resolve_by_tag(inv: &InventoryData, tag: &str) -> Option<Vec<Destination>> {
    let matches: Vec<Destination> = inv
        .all()
        .iter()
        .filter(|d| d.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
        .cloned()
        .collect();
    if matches.is_empty() { None } else { Some(matches) }
}

fn resolve_by_name(inv: &InventoryData, name: &str) -> Option<Destination> {
    inv.all()
        .iter()
        .find(|d| d.display_name().eq_ignore_ascii_case(name))
        .cloned()
}

fn resolve_by_host(inv: &InventoryData, host: &str) -> Option<Destination> {
    inv.all().iter().find(|d| d.host == host).cloned()
}

/// Parse `[user@]host[:port]` (spec §4.2 fallback step 5).
fn parse_raw_address(raw: &str, default_user: &str) -> Result<Destination, ResolveError> {
    let (user_part, rest) = match raw.split_once('@') {
        Some((u, r)) => (Some(u.to_string()), r),
        None => (None, raw),
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|e| ResolveError::BadPort(raw.to_string(), e))?;
            (h.to_string(), port)
        }
        None => (rest.to_string(), 22),
    };

    Ok(Destination {
        name: Some(raw.to_string()),
        host,
        port,
        user: Some(user_part.unwrap_or_else(|| default_user.to_string())),
        tags: Vec::new(),
        proxy_command: None,
    })
}

/// `overrides.user > destination's own user > task user > playbook user`
/// (spec §4.2 "User precedence"). `default_user` has already folded in
/// overrides/playbook; `apply_user_precedence` only needs to decide whether
/// to keep a destination's own user or replace it with an override.
fn apply_user_precedence(dest: &mut Destination, overrides: &Overrides, default_user: &str) {
    if let Some(ref u) = overrides.user {
        dest.user = Some(u.clone());
    } else if dest.user.is_none() {
        dest.user = Some(default_user.to_string());
    }
}

/// Filter keeping the first occurrence per `(host, port, user)`, preserving
/// order (spec §4.2 "Deduplication").
fn dedup(dests: Vec<Destination>) -> Vec<Destination> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(dests.len());
    for d in dests {
        let key = d.identity("");
        if seen.insert(key) {
            out.push(d);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn dest(host: &str) -> Destination {
        Destination {
            host: host.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn raw_host_port() {
        let pb = Playbook::default();
        let overrides = Overrides::default();
        let out = resolve(&pb, None, &overrides, None, "h1:2200").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].host, "h1");
        assert_eq!(out[0].port, 2200);
    }

    #[test]
    fn user_at_host_port() {
        let pb = Playbook::default();
        let overrides = Overrides::default();
        let out = resolve(&pb, None, &overrides, None, "deploy@h1:2200").unwrap();
        assert_eq!(out[0].user.as_deref(), Some("deploy"));
        assert_eq!(out[0].port, 2200);
    }

    #[test]
    fn bad_port_errors() {
        let pb = Playbook::default();
        let overrides = Overrides::default();
        let err = resolve(&pb, None, &overrides, None, "h1:nope").unwrap_err();
        assert!(matches!(err, ResolveError::BadPort(_, _)));
    }

    #[test]
    fn empty_group_contributes_nothing_without_error() {
        let mut pb = Playbook::default();
        pb.targets.insert(
            "t".to_string(),
            Target {
                groups: vec!["empty".to_string()],
                ..Default::default()
            },
        );
        let mut inv = InventoryData {
            groups: HashMap::from([("empty".to_string(), vec![])]),
            hosts: vec![],
        };
        inv.materialize_all(None);
        let overrides = Overrides::default();
        let err = resolve(&pb, Some(&inv), &overrides, None, "t").unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[test]
    fn task_user_sits_between_overrides_and_playbook_user() {
        let mut pb = Playbook {
            user: Some("playbook-default".to_string()),
            ..Default::default()
        };
        pb.targets.insert(
            "t".to_string(),
            Target {
                hosts: vec![dest("h1")],
                ..Default::default()
            },
        );
        let overrides = Overrides::default();

        // No task user set: falls back to playbook user.
        let out = resolve(&pb, None, &overrides, None, "t").unwrap();
        assert_eq!(out[0].user.as_deref(), Some("playbook-default"));

        // Task user set: wins over playbook user.
        let out = resolve(&pb, None, &overrides, Some("task-default"), "t").unwrap();
        assert_eq!(out[0].user.as_deref(), Some("task-default"));

        // CLI override still wins over task user.
        let overrides_cli = Overrides {
            user: Some("cli-override".to_string()),
            ..Default::default()
        };
        let out = resolve(&pb, None, &overrides_cli, Some("task-default"), "t").unwrap();
        assert_eq!(out[0].user.as_deref(), Some("cli-override"));
    }

    #[test]
    fn dedup_across_sources_keeps_first_occurrence_order() {
        let mut pb = Playbook::default();
        pb.targets.insert(
            "t".to_string(),
            Target {
                hosts: vec![dest("h1")],
                groups: vec!["g".to_string()],
                names: vec!["h1".to_string()],
                ..Default::default()
            },
        );
        let mut inv = InventoryData {
            groups: HashMap::from([("g".to_string(), vec![dest("h1")])]),
            hosts: vec![],
        };
        inv.materialize_all(None);
        let overrides = Overrides::default();
        let out = resolve(&pb, Some(&inv), &overrides, None, "t").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].host, "h1");
    }
}
