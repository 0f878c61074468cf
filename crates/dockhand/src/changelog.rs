//! Change-log parsing and release eligibility.
//!
//! Each package records its history in a `CHANGES.rst` with sections like:
//!
//! ```text
//! 1.2.0 (unreleased)
//! ------------------
//!
//! - Support YAML serialization.
//!
//! 1.1.0 (2025-11-02)
//! ------------------
//!
//! - Initial feature set.
//! ```
//!
//! A package is release-eligible iff its topmost section carries the
//! unreleased marker and lists at least one real entry. The scanner only
//! reads; rewriting the change log is the external release tool's job.

use std::fs;
use std::sync::LazyLock;

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Layout;
use crate::registry::Registry;

/// Change-log file name inside a package checkout.
pub const CHANGELOG_FILE: &str = "CHANGES.rst";

/// Marker strings, kept in one place so they stay swappable.
pub const UNRELEASED_LABEL: &str = "unreleased";
pub const SENTINEL_ENTRIES: &[&str] = &["Nothing changed yet.", "No changes yet."];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionLabel {
    Unreleased,
    /// Released sections carry their release date string.
    Released(String),
}

/// One parsed block of a package's change history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub version: String,
    pub label: SectionLabel,
    /// Bullet entries, marker text stripped of the leading `- `.
    pub entries: Vec<String>,
}

impl Section {
    pub fn is_unreleased(&self) -> bool {
        self.label == SectionLabel::Unreleased
    }

    /// Entries that are not the "nothing changed yet" placeholder.
    pub fn real_entries(&self) -> impl Iterator<Item = &String> {
        self.entries
            .iter()
            .filter(|e| !SENTINEL_ENTRIES.iter().any(|s| e.contains(s)))
    }
}

static HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+\.\d+(?:\.\d+)?(?:\.[A-Za-z0-9]+)?)\s+\(([^)]+)\)\s*$").expect("header regex")
});
static UNDERLINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-+\s*$").expect("underline regex"));
static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-\s+(\S.*)$").expect("bullet regex"));

/// Parse all sections of a change-log document, topmost first.
pub fn parse_changelog(content: &str) -> Vec<Section> {
    let (header, underline, bullet) = (&*HEADER, &*UNDERLINE, &*BULLET);

    let lines: Vec<&str> = content.lines().collect();
    let mut sections: Vec<Section> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let caps = match header.captures(lines[i]) {
            Some(caps) if i + 1 < lines.len() && underline.is_match(lines[i + 1]) => caps,
            _ => {
                i += 1;
                continue;
            }
        };

        let version = caps[1].to_string();
        let label_raw = caps[2].trim();
        let label = if label_raw.eq_ignore_ascii_case(UNRELEASED_LABEL) {
            SectionLabel::Unreleased
        } else {
            SectionLabel::Released(label_raw.to_string())
        };

        let mut entries = Vec::new();
        i += 2;
        while i < lines.len() {
            let next_is_header =
                header.is_match(lines[i]) && i + 1 < lines.len() && underline.is_match(lines[i + 1]);
            if next_is_header {
                break;
            }
            if let Some(b) = bullet.captures(lines[i]) {
                entries.push(b[1].trim_end().to_string());
            }
            i += 1;
        }

        sections.push(Section {
            version,
            label,
            entries,
        });
    }

    sections
}

/// Per-package eligibility verdict with a human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eligibility {
    pub package: String,
    pub eligible: bool,
    pub version: Option<String>,
    pub reason: String,
}

/// Decide eligibility from raw change-log content (`None` = file missing).
pub fn assess(package: &str, content: Option<&str>) -> Eligibility {
    let verdict = |eligible: bool, version: Option<String>, reason: &str| Eligibility {
        package: package.to_string(),
        eligible,
        version,
        reason: reason.to_string(),
    };

    let Some(content) = content else {
        return verdict(false, None, "no changelog");
    };

    let sections = parse_changelog(content);
    let Some(top) = sections.first() else {
        return verdict(false, None, "no unreleased section");
    };
    if !top.is_unreleased() {
        return verdict(false, None, "no unreleased section");
    }

    let version = Some(top.version.clone());
    if top.entries.is_empty() {
        return verdict(false, version, "unreleased section is empty");
    }
    if top.real_entries().next().is_none() {
        return verdict(false, version, "no changes yet");
    }
    verdict(true, version, "has unreleased changes")
}

/// Scan every registry package's change log, in registry order.
pub fn scan(registry: &Registry, layout: &Layout) -> Result<Vec<Eligibility>> {
    let mut results = Vec::with_capacity(registry.len());
    for package in registry.packages() {
        let package_dir = layout.package_dir(package);
        if !package_dir.exists() {
            results.push(Eligibility {
                package: package.name.clone(),
                eligible: false,
                version: None,
                reason: "package directory not found".to_string(),
            });
            continue;
        }
        let changelog = package_dir.join(CHANGELOG_FILE);
        let content = if changelog.exists() {
            Some(fs::read_to_string(&changelog)?)
        } else {
            None
        };
        results.push(assess(&package.name, content.as_deref()));
    }
    Ok(results)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedRelease {
    pub name: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseTier {
    pub tier: u32,
    pub name: String,
    pub packages: Vec<PlannedRelease>,
}

/// Ordered batch of eligible packages grouped by tier. Within a tier the
/// order is registry order; across tiers, strict precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasePlan {
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub tiers: Vec<ReleaseTier>,
}

impl ReleasePlan {
    pub fn package_count(&self) -> usize {
        self.tiers.iter().map(|t| t.packages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.package_count() == 0
    }

    /// Flat iteration in release order.
    pub fn packages(&self) -> impl Iterator<Item = &PlannedRelease> {
        self.tiers.iter().flat_map(|t| t.packages.iter())
    }
}

/// Group eligible packages into a tiered release plan.
pub fn build_plan(registry: &Registry, eligibilities: &[Eligibility]) -> ReleasePlan {
    let mut tiers: Vec<ReleaseTier> = Vec::new();

    for eligibility in eligibilities.iter().filter(|e| e.eligible) {
        let Some(package) = registry.get(&eligibility.package) else {
            continue;
        };
        let planned = PlannedRelease {
            name: package.name.clone(),
            version: eligibility.version.clone(),
        };
        match tiers.iter_mut().find(|t| t.tier == package.tier) {
            Some(tier) => tier.packages.push(planned),
            None => tiers.push(ReleaseTier {
                tier: package.tier,
                name: registry
                    .tier_name(package.tier)
                    .unwrap_or_default()
                    .to_string(),
                packages: vec![planned],
            }),
        }
    }

    tiers.sort_by_key(|t| t.tier);

    let mut hasher = Sha256::new();
    for planned in tiers.iter().flat_map(|t| t.packages.iter()) {
        hasher.update(planned.name.as_bytes());
        hasher.update(b"@");
        hasher.update(planned.version.as_deref().unwrap_or("?").as_bytes());
        hasher.update(b"\n");
    }

    ReleasePlan {
        plan_id: hex::encode(hasher.finalize()),
        created_at: Utc::now(),
        tiers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Layout};

    const WITH_CHANGES: &str = "\
1.2.0 (unreleased)
------------------

- Support YAML defaults.
- Fix ordering of exported keys.

1.1.0 (2025-11-02)
------------------

- Initial feature set.
";

    const SENTINEL_ONLY: &str = "\
1.2.0 (unreleased)
------------------

- Nothing changed yet.

1.1.0 (2025-11-02)
------------------

- Initial feature set.
";

    const RELEASED_TOP: &str = "\
1.1.0 (2025-11-02)
------------------

- Initial feature set.
";

    #[test]
    fn parses_sections_with_labels_and_entries() {
        let sections = parse_changelog(WITH_CHANGES);
        assert_eq!(sections.len(), 2);

        let top = &sections[0];
        assert_eq!(top.version, "1.2.0");
        assert!(top.is_unreleased());
        assert_eq!(top.entries.len(), 2);
        assert_eq!(top.entries[0], "Support YAML defaults.");

        let bottom = &sections[1];
        assert_eq!(
            bottom.label,
            SectionLabel::Released("2025-11-02".to_string())
        );
    }

    #[test]
    fn unreleased_with_real_entry_is_eligible() {
        let e = assess("odict", Some(WITH_CHANGES));
        assert!(e.eligible);
        assert_eq!(e.version.as_deref(), Some("1.2.0"));
        assert_eq!(e.reason, "has unreleased changes");
    }

    #[test]
    fn sentinel_only_section_is_not_eligible() {
        let e = assess("odict", Some(SENTINEL_ONLY));
        assert!(!e.eligible);
        assert_eq!(e.reason, "no changes yet");
    }

    #[test]
    fn released_topmost_section_is_not_eligible() {
        let e = assess("odict", Some(RELEASED_TOP));
        assert!(!e.eligible);
        assert_eq!(e.reason, "no unreleased section");
    }

    #[test]
    fn missing_changelog_is_not_eligible() {
        let e = assess("odict", None);
        assert!(!e.eligible);
        assert_eq!(e.reason, "no changelog");
    }

    #[test]
    fn empty_unreleased_section_is_not_eligible() {
        let content = "1.2.0 (unreleased)\n------------------\n";
        let e = assess("odict", Some(content));
        assert!(!e.eligible);
        assert_eq!(e.reason, "unreleased section is empty");
    }

    #[test]
    fn sentinel_plus_real_entry_is_eligible() {
        let content = "\
1.2.0 (unreleased)
------------------

- Nothing changed yet.
- Actually, one real fix.
";
        let e = assess("odict", Some(content));
        assert!(e.eligible);
    }

    const MANIFEST: &str = r#"
tiers = ["base", "node", "app"]

[[package]]
name = "odict"
tier = 0

[[package]]
name = "plumber"
tier = 0

[[package]]
name = "node"
tier = 1

[[package]]
name = "cone.app"
tier = 2
"#;

    fn eligibility(name: &str, eligible: bool) -> Eligibility {
        Eligibility {
            package: name.to_string(),
            eligible,
            version: Some("1.0.0".to_string()),
            reason: String::new(),
        }
    }

    #[test]
    fn plan_groups_by_tier_and_keeps_registry_order() {
        let registry = Registry::from_manifest_str(MANIFEST).expect("registry");
        let eligibilities = vec![
            eligibility("odict", true),
            eligibility("plumber", true),
            eligibility("node", false),
            eligibility("cone.app", true),
        ];

        let plan = build_plan(&registry, &eligibilities);
        assert_eq!(plan.package_count(), 3);
        assert_eq!(plan.tiers.len(), 2);

        assert_eq!(plan.tiers[0].tier, 0);
        assert_eq!(plan.tiers[0].name, "base");
        let names: Vec<_> = plan.tiers[0].packages.iter().map(|p| &p.name).collect();
        assert_eq!(names, vec!["odict", "plumber"]);

        assert_eq!(plan.tiers[1].tier, 2);
        assert_eq!(plan.tiers[1].packages[0].name, "cone.app");
    }

    #[test]
    fn plan_id_is_stable_for_same_inputs() {
        let registry = Registry::from_manifest_str(MANIFEST).expect("registry");
        let eligibilities = vec![eligibility("odict", true)];
        let a = build_plan(&registry, &eligibilities);
        let b = build_plan(&registry, &eligibilities);
        assert_eq!(a.plan_id, b.plan_id);
    }

    #[test]
    fn scan_reports_missing_directory_and_missing_changelog() {
        let td = tempfile::tempdir().expect("tempdir");
        let registry = Registry::from_manifest_str(MANIFEST).expect("registry");
        let config = Config::default();
        let layout = Layout::new(td.path(), &config.layout);

        // odict: eligible; plumber: dir without changelog; others missing.
        let odict_dir = td.path().join("sources/odict");
        std::fs::create_dir_all(&odict_dir).expect("mkdir");
        std::fs::write(odict_dir.join(CHANGELOG_FILE), WITH_CHANGES).expect("write");
        std::fs::create_dir_all(td.path().join("sources/plumber")).expect("mkdir");

        let results = scan(&registry, &layout).expect("scan");
        let by_name = |name: &str| {
            results
                .iter()
                .find(|e| e.package == name)
                .expect("present")
                .clone()
        };

        assert!(by_name("odict").eligible);
        assert_eq!(by_name("plumber").reason, "no changelog");
        assert_eq!(by_name("node").reason, "package directory not found");
        assert!(!by_name("cone.app").eligible);
        assert_eq!(results.len(), 4);
    }
}
