//! Startup validation of the on-disk persona and council files.
//!
//! CRLF line endings are normalized in place (a fixed point — LF files
//! are untouched), frontmatter is validated, and the per-kind
//! `index.json` files are rebuilt from the entries that validate.
//! Malformed files are not loaded; they are remembered so the user can
//! opt into AI-assisted correction after the channel authenticates.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Fields every persona/council must declare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    /// `id` or `slug` — either key is accepted on disk.
    pub slug: String,
    pub name: String,
    pub model_tier: String,
    pub description: String,
    pub tools: Vec<String>,
}

#[derive(Debug)]
pub struct ValidationReport {
    pub personas: Vec<EntryMeta>,
    pub councils: Vec<EntryMeta>,
    /// `(path, error)` for files that failed validation.
    pub malformed: Vec<(PathBuf, String)>,
    /// Files whose line endings were rewritten.
    pub normalized: usize,
}

/// Run the whole pass against the bot root. Idempotent: a second run on
/// the same tree reports zero normalizations and the same indexes.
pub fn validate(bot_root: &Path) -> std::io::Result<ValidationReport> {
    let mut report = ValidationReport {
        personas: Vec::new(),
        councils: Vec::new(),
        malformed: Vec::new(),
        normalized: 0,
    };

    // personas/<slug>/persona.json
    let personas_dir = bot_root.join("personas");
    if personas_dir.is_dir() {
        for entry in std::fs::read_dir(&personas_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let file = entry.path().join("persona.json");
            if !file.exists() {
                continue;
            }
            match check_file(&file, &mut report.normalized, parse_persona) {
                Ok(meta) => report.personas.push(meta),
                Err(e) => report.malformed.push((file, e)),
            }
        }
        report.personas.sort_by(|a, b| a.slug.cmp(&b.slug));
        write_index(&personas_dir.join("index.json"), &report.personas)?;
    }

    // councils/*.md
    let councils_dir = bot_root.join("councils");
    if councils_dir.is_dir() {
        for entry in std::fs::read_dir(&councils_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            match check_file(&path, &mut report.normalized, parse_council) {
                Ok(meta) => report.councils.push(meta),
                Err(e) => report.malformed.push((path, e)),
            }
        }
        report.councils.sort_by(|a, b| a.slug.cmp(&b.slug));
        write_index(&councils_dir.join("index.json"), &report.councils)?;
    }

    if !report.malformed.is_empty() {
        tracing::warn!(
            count = report.malformed.len(),
            "malformed persona/council files skipped"
        );
    }
    Ok(report)
}

/// Normalize CRLF in place, then parse.
fn check_file(
    path: &Path,
    normalized: &mut usize,
    parse: fn(&str) -> Result<EntryMeta, String>,
) -> Result<EntryMeta, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let content = if content.contains("\r\n") {
        let fixed = content.replace("\r\n", "\n");
        std::fs::write(path, &fixed).map_err(|e| e.to_string())?;
        *normalized += 1;
        fixed
    } else {
        content
    };
    parse(&content)
}

fn parse_persona(content: &str) -> Result<EntryMeta, String> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| format!("bad JSON: {e}"))?;
    meta_from_value(&value)
}

/// Council files are markdown with a YAML frontmatter block.
fn parse_council(content: &str) -> Result<EntryMeta, String> {
    let frontmatter = extract_frontmatter(content).ok_or("missing frontmatter block")?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(frontmatter).map_err(|e| format!("bad YAML: {e}"))?;
    let json = serde_json::to_value(value).map_err(|e| e.to_string())?;
    meta_from_value(&json)
}

pub fn extract_frontmatter(content: &str) -> Option<&str> {
    let rest = content.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    Some(&rest[..end])
}

fn meta_from_value(value: &serde_json::Value) -> Result<EntryMeta, String> {
    let slug = value
        .get("id")
        .or_else(|| value.get("slug"))
        .and_then(|v| v.as_str())
        .ok_or("missing id/slug")?;
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or("missing name")?;
    let model_tier = value
        .get("model_tier")
        .or_else(|| value.get("model"))
        .and_then(|v| v.as_str())
        .ok_or("missing model tier")?;
    let description = value
        .get("description")
        .and_then(|v| v.as_str())
        .ok_or("missing description")?;
    let tools = value
        .get("tools")
        .and_then(|v| v.as_array())
        .ok_or("missing tools")?
        .iter()
        .filter_map(|t| t.as_str())
        .map(String::from)
        .collect();

    Ok(EntryMeta {
        slug: slug.to_string(),
        name: name.to_string(),
        model_tier: model_tier.to_string(),
        description: description.to_string(),
        tools,
    })
}

fn write_index(path: &Path, entries: &[EntryMeta]) -> std::io::Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(entries)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona_json(slug: &str) -> String {
        serde_json::json!({
            "id": slug,
            "name": "Researcher",
            "model_tier": "workhorse",
            "description": "Finds things out",
            "tools": ["search.web", "http.get"],
        })
        .to_string()
    }

    fn setup(dir: &Path) {
        let p = dir.join("personas/researcher");
        std::fs::create_dir_all(&p).unwrap();
        std::fs::write(p.join("persona.json"), persona_json("researcher")).unwrap();

        let broken = dir.join("personas/broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("persona.json"), r#"{"name": "no slug"}"#).unwrap();

        let councils = dir.join("councils");
        std::fs::create_dir_all(&councils).unwrap();
        std::fs::write(
            councils.join("review.md"),
            "---\r\nid: review\r\nname: Review Council\r\nmodel_tier: smart\r\ndescription: Reviews work\r\ntools: []\r\n---\r\n# Council\r\n",
        )
        .unwrap();
    }

    #[test]
    fn validates_and_rebuilds_indexes() {
        let dir = tempfile::TempDir::new().unwrap();
        setup(dir.path());

        let report = validate(dir.path()).unwrap();
        assert_eq!(report.personas.len(), 1);
        assert_eq!(report.personas[0].slug, "researcher");
        assert_eq!(report.councils.len(), 1);
        assert_eq!(report.malformed.len(), 1);
        assert_eq!(report.normalized, 1, "council file had CRLF");

        let index: Vec<EntryMeta> = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("personas/index.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn second_run_is_a_fixed_point() {
        let dir = tempfile::TempDir::new().unwrap();
        setup(dir.path());

        validate(dir.path()).unwrap();
        let council_after_first =
            std::fs::read_to_string(dir.path().join("councils/review.md")).unwrap();
        let report = validate(dir.path()).unwrap();
        let council_after_second =
            std::fs::read_to_string(dir.path().join("councils/review.md")).unwrap();

        assert_eq!(report.normalized, 0, "LF files stay untouched");
        assert_eq!(council_after_first, council_after_second);
        assert!(!council_after_second.contains('\r'));
        // The malformed file is reported again but not rewritten.
        assert_eq!(report.malformed.len(), 1);
    }

    #[test]
    fn frontmatter_extraction() {
        assert_eq!(
            extract_frontmatter("---\na: 1\n---\nbody"),
            Some("\na: 1")
        );
        assert!(extract_frontmatter("no frontmatter").is_none());
    }

    #[test]
    fn slug_key_also_accepted() {
        let value = serde_json::json!({
            "slug": "aide", "name": "Aide", "model": "intake",
            "description": "d", "tools": [],
        });
        let meta = meta_from_value(&value).unwrap();
        assert_eq!(meta.slug, "aide");
        assert_eq!(meta.model_tier, "intake");
    }
}
