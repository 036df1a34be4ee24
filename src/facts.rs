//! Project facts read directly from manifests, without the service.
//!
//! - declared dependencies (`Cargo.toml`, `pyproject.toml`,
//!   `requirements.txt`, `package.json`), appended to the dependencies
//!   page;
//! - test files and the commands that run them, rendered as the testing
//!   page.
//!
//! Unparsable manifests are skipped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::models::is_test_path;

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn version_text(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Table(t) => t
            .get("version")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| t.get("path").map(|_| "(path)".to_string()))
            .or_else(|| t.get("git").map(|_| "(git)".to_string()))
            .or_else(|| t.get("workspace").map(|_| "(workspace)".to_string()))
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

fn toml_table_deps(table: Option<&toml::Value>, out: &mut BTreeSet<String>) {
    if let Some(toml::Value::Table(deps)) = table {
        for (name, spec) in deps {
            let version = version_text(spec);
            if version.is_empty() {
                out.insert(name.clone());
            } else {
                out.insert(format!("{} {}", name, version));
            }
        }
    }
}

fn cargo_deps(content: &str, out: &mut BTreeSet<String>) {
    let Ok(doc) = content.parse::<toml::Value>() else {
        return;
    };
    for section in ["dependencies", "dev-dependencies", "build-dependencies"] {
        toml_table_deps(doc.get(section), out);
    }
    toml_table_deps(
        doc.get("workspace").and_then(|w| w.get("dependencies")),
        out,
    );
}

fn pyproject_deps(content: &str, out: &mut BTreeSet<String>) {
    let Ok(doc) = content.parse::<toml::Value>() else {
        return;
    };
    toml_table_deps(
        doc.get("tool")
            .and_then(|t| t.get("poetry"))
            .and_then(|p| p.get("dependencies")),
        out,
    );
    if let Some(list) = doc
        .get("project")
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_array())
    {
        out.extend(list.iter().filter_map(|v| v.as_str()).map(str::to_string));
    }
}

fn requirements_deps(content: &str, out: &mut BTreeSet<String>) {
    out.extend(
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('-'))
            .map(str::to_string),
    );
}

fn package_json_deps(content: &str, out: &mut BTreeSet<String>) {
    let Ok(doc) = serde_json::from_str::<serde_json::Value>(content) else {
        return;
    };
    for section in ["dependencies", "devDependencies"] {
        if let Some(deps) = doc.get(section).and_then(|d| d.as_object()) {
            for (name, version) in deps {
                out.insert(format!("{} {}", name, version.as_str().unwrap_or_default()));
            }
        }
    }
}

/// Sorted, de-duplicated dependency lines across all manifests.
pub fn collect_dependencies(contents: &HashMap<String, Arc<str>>) -> Vec<String> {
    let mut deps = BTreeSet::new();
    for (path, content) in contents {
        match file_name(path) {
            "Cargo.toml" => cargo_deps(content, &mut deps),
            "pyproject.toml" => pyproject_deps(content, &mut deps),
            "requirements.txt" => requirements_deps(content, &mut deps),
            "package.json" => package_json_deps(content, &mut deps),
            _ => {}
        }
    }
    deps.into_iter().collect()
}

/// Test files found in the repository and how to run them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestInfo {
    pub paths: Vec<String>,
    pub commands: Vec<String>,
}

pub fn collect_test_info(contents: &HashMap<String, Arc<str>>) -> TestInfo {
    let mut paths: Vec<String> = contents
        .keys()
        .filter(|p| is_test_path(p))
        .cloned()
        .collect();
    paths.sort();

    let mut commands = BTreeSet::new();
    for (path, content) in contents {
        match file_name(path) {
            "Cargo.toml" => {
                commands.insert("cargo test".to_string());
            }
            "go.mod" => {
                commands.insert("go test ./...".to_string());
            }
            "setup.cfg" | "pytest.ini" => {
                commands.insert("pytest".to_string());
            }
            "tox.ini" => {
                commands.insert("tox".to_string());
            }
            "pyproject.toml" => {
                if let Ok(doc) = content.parse::<toml::Value>() {
                    let tool = doc.get("tool");
                    if tool.and_then(|t| t.get("poetry")).and_then(|p| p.get("scripts")).is_some() {
                        commands.insert("poetry run pytest".to_string());
                    } else if tool.and_then(|t| t.get("pytest")).is_some() {
                        commands.insert("pytest".to_string());
                    }
                }
            }
            "package.json" => {
                let has_test = serde_json::from_str::<serde_json::Value>(content)
                    .ok()
                    .and_then(|doc| doc.get("scripts").and_then(|s| s.get("test")).cloned())
                    .is_some();
                if has_test {
                    commands.insert("npm test".to_string());
                }
            }
            _ => {}
        }
    }

    TestInfo {
        paths,
        commands: commands.into_iter().collect(),
    }
}

/// Body of the testing page.
pub fn render_testing(info: &TestInfo) -> String {
    if info.paths.is_empty() {
        return "No tests found.\n".to_string();
    }
    let tests: Vec<String> = info.paths.iter().map(|p| format!("- `{}`", p)).collect();
    let commands = if info.commands.is_empty() {
        "- (no run command detected)".to_string()
    } else {
        info.commands
            .iter()
            .map(|c| format!("- `{}`", c))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "## Tests found\n\n{}\n\n## How to run\n\n{}\n",
        tests.join("\n"),
        commands
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(files: &[(&str, &str)]) -> HashMap<String, Arc<str>> {
        files
            .iter()
            .map(|(p, c)| (p.to_string(), Arc::from(*c)))
            .collect()
    }

    #[test]
    fn dependencies_from_manifests() {
        let files = contents(&[
            (
                "Cargo.toml",
                "[package]\nname = \"x\"\n[dependencies]\nserde = { version = \"1\", features = [\"derive\"] }\nanyhow = \"1\"\nlocal = { path = \"../local\" }\n",
            ),
            ("api/requirements.txt", "# pinned\nrequests==2.31\n\n-r base.txt\n"),
            ("web/package.json", r#"{"dependencies": {"react": "^18"}, "devDependencies": {"vite": "5"}}"#),
            ("pyproject.toml", "[project]\ndependencies = [\"httpx>=0.27\"]\n"),
            ("broken/package.json", "{ nope"),
        ]);
        assert_eq!(
            collect_dependencies(&files),
            vec![
                "anyhow 1",
                "httpx>=0.27",
                "local (path)",
                "react ^18",
                "requests==2.31",
                "serde 1",
                "vite 5",
            ]
        );
    }

    #[test]
    fn test_info_and_rendering() {
        let files = contents(&[
            ("tests/test_app.py", "def test(): pass"),
            ("app.py", "x = 1"),
            ("tox.ini", "[tox]"),
            ("package.json", r#"{"scripts": {"test": "jest"}}"#),
        ]);
        let info = collect_test_info(&files);
        assert_eq!(info.paths, vec!["tests/test_app.py"]);
        assert_eq!(info.commands, vec!["npm test", "tox"]);
        let page = render_testing(&info);
        assert!(page.contains("- `tests/test_app.py`"));
        assert!(page.contains("- `tox`"));
    }

    #[test]
    fn no_tests() {
        let info = collect_test_info(&contents(&[("app.py", "")]));
        assert_eq!(render_testing(&info), "No tests found.\n");
    }
}
