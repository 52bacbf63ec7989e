/// Persistent alias↔JID map with validation, fuzzy query, and roster sync.
///
/// Modeled on the existing `Config::load` shape (read file → `shellexpand`/
/// `serde_json` → in-memory struct) for loading, and on a write-to-temp-then-
/// rename pattern for persistence, since the teacher has no on-disk mutable
/// store of its own to imitate directly.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::xmpp::stanzas::RosterItem;

const FORMAT_VERSION: u32 = 1;
const MAX_ALIAS_LEN: usize = 50;
const MAX_JID_LEN: usize = 200;
/// Candidates within this many points of the top score are considered tied
/// for `resolve`'s ambiguity check.
const AMBIGUITY_MARGIN: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    Manual,
    RosterAuto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub alias: String,
    pub jid: String,
    pub origin: Origin,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedFile {
    version: u32,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    Absent,
}

#[derive(Debug, Clone)]
pub struct QueryMatch {
    pub alias: String,
    pub jid: String,
    pub score: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub added: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Validates an alias: length 1-50, `[a-z0-9][a-z0-9._-]*` after lower-casing.
pub fn validate_alias(alias: &str) -> Result<String, BridgeError> {
    let lower = alias.to_lowercase();
    if lower.is_empty() || lower.len() > MAX_ALIAS_LEN {
        return Err(BridgeError::InvalidAlias { alias: alias.to_string() });
    }
    let mut chars = lower.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(BridgeError::InvalidAlias { alias: alias.to_string() });
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-') {
        return Err(BridgeError::InvalidAlias { alias: alias.to_string() });
    }
    Ok(lower)
}

/// Validates a JID shape: `localpart@domain[/resource]`, length 1-200.
pub fn validate_jid(jid: &str) -> Result<(), BridgeError> {
    if jid.is_empty() || jid.len() > MAX_JID_LEN {
        return Err(BridgeError::InvalidJid { jid: jid.to_string() });
    }
    let without_resource = crate::converters::bare_jid(jid);
    let mut parts = without_resource.splitn(2, '@');
    match (parts.next(), parts.next()) {
        (Some(local), Some(domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(BridgeError::InvalidJid { jid: jid.to_string() }),
    }
}

/// Slugifies a display name (or JID localpart) into a candidate alias:
/// lower-case, strip to `[a-z0-9._-]`, collapse runs of `-`, trim.
fn slugify(input: &str) -> String {
    let lower = input.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_dash = false;
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            out.push(c);
            last_was_dash = false;
        } else if c == '-' {
            if !last_was_dash {
                out.push('-');
            }
            last_was_dash = true;
        } else {
            if !last_was_dash && !out.is_empty() {
                out.push('-');
                last_was_dash = true;
            }
        }
    }
    out.trim_matches('-').to_string()
}

fn candidate_alias_for(item: &RosterItem) -> String {
    let from_name = item
        .name
        .as_deref()
        .map(slugify)
        .filter(|s| !s.is_empty());
    from_name.unwrap_or_else(|| {
        let local = crate::converters::bare_jid(&item.jid)
            .split('@')
            .next()
            .unwrap_or(&item.jid);
        slugify(local)
    })
}

/// Fuzzy score in `[0,100]` blending Jaro-Winkler similarity against both
/// alias and JID, with a substring-match floor so degenerate inputs (empty
/// term, exact containment) still score sensibly.
fn score(term: &str, alias: &str, jid: &str) -> u8 {
    if term.is_empty() {
        return 0;
    }
    let term_lc = term.to_lowercase();
    let alias_lc = alias.to_lowercase();
    let jid_lc = jid.to_lowercase();

    if alias_lc == term_lc {
        return 100;
    }

    let alias_sim = strsim::jaro_winkler(&term_lc, &alias_lc) * 100.0;
    let jid_sim = strsim::jaro_winkler(&term_lc, &jid_lc) * 80.0; // JID signal weighted down

    let substring_floor = if alias_lc.contains(&term_lc) {
        75.0
    } else if jid_lc.contains(&term_lc) {
        50.0
    } else {
        0.0
    };

    alias_sim.max(jid_sim).max(substring_floor).min(100.0).round() as u8
}

pub struct AddressBook {
    path: PathBuf,
    entries: RwLock<HashMap<String, Entry>>,
}

impl AddressBook {
    /// Loads from `path`. On missing/corrupt file, starts empty and logs —
    /// never fails construction.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<PersistedFile>(&content) {
                Ok(file) => file
                    .entries
                    .into_iter()
                    .map(|e| (e.alias.clone(), e))
                    .collect(),
                Err(e) => {
                    warn!("Address book at {path:?} is corrupt ({e}), starting empty");
                    HashMap::new()
                }
            },
            Err(_) => {
                info!("No address book found at {path:?}, starting empty");
                HashMap::new()
            }
        };

        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    /// Atomic write-to-temp-then-rename. Logs and returns on failure without
    /// propagating — persistence errors never block a caller (§7).
    async fn persist(&self) {
        let entries = self.entries.read().await;
        let file = PersistedFile {
            version: FORMAT_VERSION,
            entries: entries.values().cloned().collect(),
        };
        drop(entries);

        let content = match serde_json::to_string_pretty(&file) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to serialize address book: {e}");
                return;
            }
        };

        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Failed to create address book directory {parent:?}: {e}");
                return;
            }
        }

        let tmp_path = tmp_path_for(&self.path);
        if let Err(e) = tokio::fs::write(&tmp_path, content).await {
            warn!("Failed to write address book temp file {tmp_path:?}: {e}");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            warn!("Failed to rename address book temp file into place: {e}");
        }
    }

    pub async fn save(&self, alias: &str, jid: &str) -> Result<SaveOutcome, BridgeError> {
        let alias = validate_alias(alias)?;
        validate_jid(jid)?;

        let mut entries = self.entries.write().await;
        let outcome = match entries.get(&alias) {
            Some(existing) if existing.jid == jid => SaveOutcome::Unchanged,
            _ => {
                entries.insert(
                    alias.clone(),
                    Entry {
                        alias: alias.clone(),
                        jid: jid.to_string(),
                        origin: Origin::Manual,
                    },
                );
                SaveOutcome::Updated
            }
        };
        drop(entries);

        if outcome == SaveOutcome::Updated {
            self.persist().await;
        }
        Ok(outcome)
    }

    pub async fn remove(&self, alias: &str) -> RemoveOutcome {
        let alias = alias.to_lowercase();
        let mut entries = self.entries.write().await;
        let outcome = if entries.remove(&alias).is_some() {
            RemoveOutcome::Removed
        } else {
            RemoveOutcome::Absent
        };
        drop(entries);
        if outcome == RemoveOutcome::Removed {
            self.persist().await;
        }
        outcome
    }

    /// Distinct JIDs currently known to the address book, used to seed the
    /// XMPP client's auto-subscribe list at startup.
    pub async fn known_jids(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut jids: Vec<String> = entries.values().map(|e| e.jid.clone()).collect();
        jids.sort();
        jids.dedup();
        jids
    }

    pub async fn query(&self, term: &str, limit: Option<usize>) -> Vec<QueryMatch> {
        if term.is_empty() {
            return Vec::new();
        }
        let entries = self.entries.read().await;
        let mut matches: Vec<QueryMatch> = entries
            .values()
            .map(|e| QueryMatch {
                alias: e.alias.clone(),
                jid: e.jid.clone(),
                score: score(term, &e.alias, &e.jid),
            })
            .filter(|m| m.score > 0)
            .collect();

        matches.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.alias.cmp(&b.alias)));
        if let Some(n) = limit {
            matches.truncate(n);
        }
        matches
    }

    /// `NotFound` when no match; `Ambiguous` when ≥2 candidates are within
    /// `AMBIGUITY_MARGIN` points of the top score.
    pub async fn resolve(&self, alias: &str) -> Result<String, BridgeError> {
        let lower = alias.to_lowercase();
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&lower) {
                return Ok(entry.jid.clone());
            }
        }

        let matches = self.query(alias, None).await;
        let Some(top) = matches.first() else {
            return Err(BridgeError::UnknownAlias { alias: alias.to_string() });
        };

        let top_score = top.score as f64;
        let candidates: Vec<String> = matches
            .iter()
            .filter(|m| top_score - (m.score as f64) <= AMBIGUITY_MARGIN)
            .map(|m| m.alias.clone())
            .collect();

        if candidates.len() >= 2 {
            Err(BridgeError::AmbiguousAlias { candidates })
        } else {
            Ok(top.jid.clone())
        }
    }

    /// See §4.B step list: slugify → collision handling → validate.
    pub async fn sync_roster(&self, items: &[RosterItem]) -> SyncStats {
        let mut stats = SyncStats::default();
        let mut entries = self.entries.write().await;
        let mut dirty = false;

        for item in items {
            if validate_jid(&item.jid).is_err() {
                stats.errors += 1;
                continue;
            }
            let candidate = candidate_alias_for(item);
            if validate_alias(&candidate).is_err() {
                stats.errors += 1;
                continue;
            }

            match entries.get(&candidate) {
                Some(existing) if existing.jid == item.jid => {
                    stats.skipped += 1;
                }
                Some(existing) if existing.origin == Origin::Manual => {
                    // Manual entries are never overwritten; retry with a
                    // domain-qualified fallback alias once.
                    let domain = crate::converters::bare_jid(&item.jid)
                        .split('@')
                        .nth(1)
                        .unwrap_or("unknown");
                    let fallback = format!("{candidate}-{domain}");
                    match validate_alias(&fallback) {
                        Ok(fallback) => match entries.get(&fallback) {
                            Some(existing2) if existing2.jid == item.jid => {
                                stats.skipped += 1;
                            }
                            Some(existing2) if existing2.origin == Origin::Manual => {
                                stats.errors += 1;
                            }
                            _ => {
                                entries.insert(
                                    fallback.clone(),
                                    Entry {
                                        alias: fallback,
                                        jid: item.jid.clone(),
                                        origin: Origin::RosterAuto,
                                    },
                                );
                                stats.added += 1;
                                dirty = true;
                            }
                        },
                        Err(_) => stats.errors += 1,
                    }
                }
                // Roster-auto collision with a different JID: overwrite.
                Some(_) => {
                    entries.insert(
                        candidate.clone(),
                        Entry {
                            alias: candidate,
                            jid: item.jid.clone(),
                            origin: Origin::RosterAuto,
                        },
                    );
                    stats.added += 1;
                    dirty = true;
                }
                None => {
                    entries.insert(
                        candidate.clone(),
                        Entry {
                            alias: candidate,
                            jid: item.jid.clone(),
                            origin: Origin::RosterAuto,
                        },
                    );
                    stats.added += 1;
                    dirty = true;
                }
            }
        }
        drop(entries);

        if dirty {
            self.persist().await;
        }
        stats
    }

    /// Incremental roster sync: `added` entries go through `sync_roster`;
    /// `removed` bare JIDs drop any roster-auto alias pointing at them
    /// (manual aliases survive a roster removal).
    pub async fn sync_roster_incremental(
        &self,
        added: &[RosterItem],
        removed: &[String],
    ) -> SyncStats {
        let mut stats = self.sync_roster(added).await;

        let mut entries = self.entries.write().await;
        let mut dirty = false;
        let to_drop: Vec<String> = entries
            .values()
            .filter(|e| e.origin == Origin::RosterAuto && removed.contains(&e.jid))
            .map(|e| e.alias.clone())
            .collect();
        for alias in to_drop {
            entries.remove(&alias);
            dirty = true;
        }
        drop(entries);

        if dirty {
            self.persist().await;
        }
        stats.skipped += removed.len().saturating_sub(stats.added);
        stats
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let file_name = tmp
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("address_book.json")
        .to_string();
    tmp.set_file_name(format!("{file_name}.tmp"));
    tmp
}
